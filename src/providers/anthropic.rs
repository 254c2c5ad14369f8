use std::collections::VecDeque;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::stream::{
    ChunkHeader, FrameStream, Step, StreamTranslator, generate_completion_id, now_epoch_seconds,
    translate_sse,
};
use super::{Completion, Credential};
use crate::Result;
use crate::types::{ChatCompletionRequest, MessageContent, Role, UsageResult};
use crate::utils::http::{send_checked, send_checked_json};
use crate::utils::sse::sse_data_stream_from_response;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Clone, Debug)]
pub struct Anthropic {
    http: reqwest::Client,
    base_url: String,
}

impl Anthropic {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    fn request(&self, credential: &Credential) -> reqwest::RequestBuilder {
        self.http
            .post(self.messages_url())
            .header("x-api-key", credential.expose())
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    /// Leading system messages become the top-level `system` field; later ones
    /// are sent as user turns since the messages API only accepts
    /// user/assistant roles.
    fn request_body(request: &ChatCompletionRequest, stream: bool) -> Value {
        let (system, rest) = request.split_leading_system();

        let messages = rest
            .iter()
            .map(|message| {
                let role = match message.role {
                    Role::Assistant => "assistant",
                    Role::User | Role::System => "user",
                };
                let content = match &message.content {
                    MessageContent::Text(text) => Value::String(text.clone()),
                    MessageContent::Parts(parts) => parts.clone(),
                };
                json!({ "role": role, "content": content })
            })
            .collect::<Vec<_>>();

        let mut body = Map::<String, Value>::new();
        body.insert("model".to_string(), Value::String(request.model.clone()));
        body.insert("messages".to_string(), Value::Array(messages));
        body.insert(
            "max_tokens".to_string(),
            Value::from(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        );
        if let Some(system) = system {
            body.insert("system".to_string(), Value::String(system));
        }
        if let Some(temperature) = request.temperature {
            body.insert("temperature".to_string(), Value::from(temperature));
        }
        if let Some(top_p) = request.top_p {
            body.insert("top_p".to_string(), Value::from(top_p));
        }
        if let Some(stop) = &request.stop {
            body.insert(
                "stop_sequences".to_string(),
                Value::Array(stop.to_vec().into_iter().map(Value::String).collect()),
            );
        }
        if stream {
            body.insert("stream".to_string(), Value::Bool(true));
        }
        Value::Object(body)
    }

    pub async fn complete(
        &self,
        request: &ChatCompletionRequest,
        credential: &Credential,
    ) -> Result<Completion> {
        let body = Self::request_body(request, false);
        let parsed: MessagesResponse = send_checked_json(self.request(credential).json(&body)).await?;
        Ok(parsed.into_completion(&request.model))
    }

    pub async fn stream(
        &self,
        request: &ChatCompletionRequest,
        credential: &Credential,
    ) -> Result<FrameStream> {
        let body = Self::request_body(request, true);
        let response = send_checked(
            self.request(credential)
                .header("accept", "text/event-stream")
                .json(&body),
        )
        .await?;

        let data_stream = sse_data_stream_from_response(response);
        Ok(translate_sse(
            data_stream,
            MessagesTranslator::new(&request.model),
        ))
    }
}

fn stop_reason_to_finish_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        Some("refusal") => "content_filter",
        _ => "stop",
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Value>,
}

impl MessagesResponse {
    fn into_completion(self, model: &str) -> Completion {
        let text = self
            .content
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<String>();

        let usage = self
            .usage
            .as_ref()
            .map(|raw| {
                UsageResult::new(
                    token_count(raw, "input_tokens"),
                    token_count(raw, "output_tokens"),
                    raw.clone(),
                )
            })
            .unwrap_or_else(|| UsageResult::new(0, 0, Value::Null));

        let response = json!({
            "id": self.id.unwrap_or_else(generate_completion_id),
            "object": "chat.completion",
            "created": now_epoch_seconds(),
            "model": model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": text },
                "finish_reason": stop_reason_to_finish_reason(self.stop_reason.as_deref()),
            }],
            "usage": usage.to_chat_usage(),
        });
        Completion { response, usage }
    }
}

fn token_count(usage: &Value, field: &str) -> u64 {
    usage.get(field).and_then(Value::as_u64).unwrap_or(0)
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    usage: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// message_start → content_block_delta* → message_delta → message_stop.
/// Input tokens arrive with message_start, output tokens with message_delta.
struct MessagesTranslator {
    header: ChunkHeader,
    input_tokens: u64,
    output_tokens: u64,
    raw_usage: Map<String, Value>,
    finish_reason: Option<&'static str>,
    sent_role: bool,
}

impl MessagesTranslator {
    fn new(model: &str) -> Self {
        Self {
            header: ChunkHeader::new(model),
            input_tokens: 0,
            output_tokens: 0,
            raw_usage: Map::new(),
            finish_reason: None,
            sent_role: false,
        }
    }

    fn merge_usage(&mut self, usage: &Value) {
        if let Some(tokens) = usage.get("input_tokens").and_then(Value::as_u64) {
            self.input_tokens = tokens;
        }
        if let Some(tokens) = usage.get("output_tokens").and_then(Value::as_u64) {
            self.output_tokens = tokens;
        }
        if let Some(obj) = usage.as_object() {
            for (key, value) in obj {
                self.raw_usage.insert(key.clone(), value.clone());
            }
        }
    }

    fn push_role(&mut self, out: &mut VecDeque<Bytes>) {
        if !self.sent_role {
            self.sent_role = true;
            out.push_back(
                self.header
                    .chunk(json!({ "role": "assistant", "content": "" }), None),
            );
        }
    }
}

impl StreamTranslator for MessagesTranslator {
    fn on_data(&mut self, data: &str, out: &mut VecDeque<Bytes>) -> Step {
        let event = match serde_json::from_str::<StreamEvent>(data) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(error = %err, "skipping unparseable anthropic event");
                return Step::Continue;
            }
        };

        match event.kind.as_str() {
            "message_start" => {
                if let Some(message) = event.message.as_ref() {
                    if let Some(id) = message.get("id").and_then(Value::as_str) {
                        self.header.id = id.to_string();
                    }
                    if let Some(usage) = message.get("usage") {
                        self.merge_usage(usage);
                    }
                }
                self.push_role(out);
            }
            "content_block_delta" => {
                let Some(delta) = event.delta.as_ref() else {
                    return Step::Continue;
                };
                if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
                    return Step::Continue;
                }
                if let Some(text) = delta.get("text").and_then(Value::as_str) {
                    self.push_role(out);
                    out.push_back(self.header.chunk(json!({ "content": text }), None));
                }
            }
            "message_delta" => {
                if let Some(usage) = event.usage.as_ref() {
                    self.merge_usage(usage);
                }
                if let Some(stop_reason) = event
                    .delta
                    .as_ref()
                    .and_then(|delta| delta.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    self.finish_reason = Some(stop_reason_to_finish_reason(Some(stop_reason)));
                }
            }
            "message_stop" => {
                let usage = UsageResult::new(
                    self.input_tokens,
                    self.output_tokens,
                    Value::Object(std::mem::take(&mut self.raw_usage)),
                );
                out.push_back(
                    self.header
                        .chunk(json!({}), Some(self.finish_reason.unwrap_or("stop"))),
                );
                out.push_back(self.header.usage_chunk(&usage));
                return Step::Finished(Some(usage));
            }
            "error" => {
                let message = event
                    .error
                    .as_ref()
                    .and_then(|error| error.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| data.to_string());
                return Step::Failed(message);
            }
            _ => {}
        }
        Step::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, StopSequences};

    #[test]
    fn body_extracts_system_and_defaults_max_tokens() {
        let mut request = ChatCompletionRequest::new(
            "claude-haiku-4-5",
            vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
                ChatMessage::system("late rule"),
            ],
        );
        request.stop = Some(StopSequences::One("END".to_string()));
        request.frequency_penalty = Some(0.5);

        let body = Anthropic::request_body(&request, false);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["stop_sequences"], json!(["END"]));
        assert!(body.get("frequency_penalty").is_none());
        assert!(body.get("stream").is_none());
        let roles: Vec<&str> = body["messages"]
            .as_array()
            .expect("messages")
            .iter()
            .filter_map(|m| m["role"].as_str())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
    }

    #[test]
    fn response_is_reshaped_into_chat_completion() {
        let parsed: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "content": [{"type": "text", "text": "Hel"}, {"type": "text", "text": "lo"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 9, "output_tokens": 4},
        }))
        .expect("response");
        let completion = parsed.into_completion("claude-haiku-4-5");
        assert_eq!(completion.response["object"], "chat.completion");
        assert_eq!(completion.response["choices"][0]["message"]["content"], "Hello");
        assert_eq!(completion.response["choices"][0]["finish_reason"], "length");
        assert_eq!(completion.response["usage"]["total_tokens"], 13);
        assert_eq!(completion.usage.input_tokens, 9);
    }

    #[test]
    fn translator_reports_usage_only_at_message_stop() {
        let mut translator = MessagesTranslator::new("claude-haiku-4-5");
        let mut out = VecDeque::new();
        let events = [
            r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":11,"output_tokens":1}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"ping"}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":6}}"#,
        ];
        for event in events {
            assert!(matches!(translator.on_data(event, &mut out), Step::Continue));
        }
        match translator.on_data(r#"{"type":"message_stop"}"#, &mut out) {
            Step::Finished(Some(usage)) => {
                assert_eq!(usage.input_tokens, 11);
                assert_eq!(usage.output_tokens, 6);
            }
            other => panic!("unexpected step: {other:?}"),
        }

        let chunks: Vec<Value> = out
            .iter()
            .map(|bytes| {
                let text = String::from_utf8_lossy(bytes);
                serde_json::from_str(text.trim_start_matches("data: ").trim_end())
                    .expect("chunk json")
            })
            .collect();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0]["id"], "msg_1");
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "Hi");
        assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");
        assert_eq!(chunks[3]["usage"]["completion_tokens"], 6);
    }

    #[test]
    fn error_event_fails_the_stream() {
        let mut translator = MessagesTranslator::new("claude-haiku-4-5");
        let mut out = VecDeque::new();
        let step = translator.on_data(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            &mut out,
        );
        assert!(matches!(step, Step::Failed(message) if message == "Overloaded"));
    }
}
