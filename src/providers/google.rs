use std::collections::VecDeque;

use bytes::Bytes;
use serde_json::{Map, Value, json};

use super::stream::{
    ChunkHeader, FrameStream, Step, StreamTranslator, generate_completion_id, now_epoch_seconds,
    translate_sse,
};
use super::{Completion, Credential};
use crate::Result;
use crate::types::{ChatCompletionRequest, ChatMessage, MessageContent, Role, UsageResult};
use crate::utils::http::{send_checked, send_checked_json};
use crate::utils::sse::sse_data_stream_from_response;

#[derive(Clone, Debug)]
pub struct Google {
    http: reqwest::Client,
    base_url: String,
}

impl Google {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!(
            "{}/models/{model}:{method}",
            self.base_url.trim_end_matches('/')
        )
    }

    fn parts(content: &MessageContent) -> Value {
        match content {
            MessageContent::Text(text) => json!([{ "text": text }]),
            MessageContent::Parts(_) => json!([{ "text": content.to_text() }]),
        }
    }

    fn content(message: &ChatMessage) -> Value {
        let role = match message.role {
            Role::Assistant => "model",
            Role::User | Role::System => "user",
        };
        json!({ "role": role, "parts": Self::parts(&message.content) })
    }

    fn request_body(request: &ChatCompletionRequest) -> Value {
        let (system, rest) = request.split_leading_system();

        let mut body = Map::<String, Value>::new();
        body.insert(
            "contents".to_string(),
            Value::Array(rest.iter().map(Self::content).collect()),
        );
        if let Some(system) = system {
            body.insert(
                "systemInstruction".to_string(),
                json!({ "parts": [{ "text": system }] }),
            );
        }

        let mut generation_config = Map::<String, Value>::new();
        if let Some(max_tokens) = request.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), Value::from(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            generation_config.insert("temperature".to_string(), Value::from(temperature));
        }
        if let Some(top_p) = request.top_p {
            generation_config.insert("topP".to_string(), Value::from(top_p));
        }
        if let Some(stop) = &request.stop {
            generation_config.insert(
                "stopSequences".to_string(),
                Value::Array(stop.to_vec().into_iter().map(Value::String).collect()),
            );
        }
        if let Some(penalty) = request.frequency_penalty {
            generation_config.insert("frequencyPenalty".to_string(), Value::from(penalty));
        }
        if let Some(penalty) = request.presence_penalty {
            generation_config.insert("presencePenalty".to_string(), Value::from(penalty));
        }
        if !generation_config.is_empty() {
            body.insert(
                "generationConfig".to_string(),
                Value::Object(generation_config),
            );
        }
        Value::Object(body)
    }

    pub async fn complete(
        &self,
        request: &ChatCompletionRequest,
        credential: &Credential,
    ) -> Result<Completion> {
        let body = Self::request_body(request);
        let raw: Value = send_checked_json(
            self.http
                .post(self.model_url(&request.model, "generateContent"))
                .header("x-goog-api-key", credential.expose())
                .json(&body),
        )
        .await?;

        let usage = parse_usage_metadata(&raw).unwrap_or_else(|| UsageResult::new(0, 0, Value::Null));
        let candidate = raw
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first());
        let text = candidate.map(candidate_text).unwrap_or_default();
        let finish_reason = candidate
            .and_then(|candidate| candidate.get("finishReason"))
            .and_then(Value::as_str);

        let response = json!({
            "id": raw
                .get("responseId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(generate_completion_id),
            "object": "chat.completion",
            "created": now_epoch_seconds(),
            "model": request.model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": text },
                "finish_reason": finish_reason_to_chat(finish_reason),
            }],
            "usage": usage.to_chat_usage(),
        });
        Ok(Completion { response, usage })
    }

    pub async fn stream(
        &self,
        request: &ChatCompletionRequest,
        credential: &Credential,
    ) -> Result<FrameStream> {
        let body = Self::request_body(request);
        let response = send_checked(
            self.http
                .post(self.model_url(&request.model, "streamGenerateContent"))
                .query(&[("alt", "sse")])
                .header("x-goog-api-key", credential.expose())
                .json(&body),
        )
        .await?;

        let data_stream = sse_data_stream_from_response(response);
        Ok(translate_sse(
            data_stream,
            CandidateTranslator::new(&request.model),
        ))
    }
}

fn candidate_text(candidate: &Value) -> String {
    candidate
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|part| part.get("thought").and_then(Value::as_bool) != Some(true))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn finish_reason_to_chat(reason: Option<&str>) -> &'static str {
    match reason {
        Some("MAX_TOKENS") => "length",
        Some("SAFETY") | Some("RECITATION") | Some("BLOCKLIST") | Some("PROHIBITED_CONTENT")
        | Some("SPII") => "content_filter",
        _ => "stop",
    }
}

fn parse_usage_metadata(chunk: &Value) -> Option<UsageResult> {
    let metadata = chunk.get("usageMetadata")?;
    let input_tokens = metadata
        .get("promptTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = metadata
        .get("candidatesTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(UsageResult::new(input_tokens, output_tokens, metadata.clone()))
}

/// Every chunk may carry `usageMetadata`; the last one seen wins. A candidate
/// with a `finishReason` ends the stream.
struct CandidateTranslator {
    header: ChunkHeader,
    usage: Option<UsageResult>,
    sent_role: bool,
}

impl CandidateTranslator {
    fn new(model: &str) -> Self {
        Self {
            header: ChunkHeader::new(model),
            usage: None,
            sent_role: false,
        }
    }
}

impl StreamTranslator for CandidateTranslator {
    fn on_data(&mut self, data: &str, out: &mut VecDeque<Bytes>) -> Step {
        let chunk = match serde_json::from_str::<Value>(data) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::debug!(error = %err, "skipping unparseable gemini chunk");
                return Step::Continue;
            }
        };

        if let Some(error) = chunk.get("error").filter(|error| !error.is_null()) {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Step::Failed(message);
        }

        if let Some(usage) = parse_usage_metadata(&chunk) {
            self.usage = Some(usage);
        }

        let Some(candidate) = chunk
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
        else {
            return Step::Continue;
        };

        let text = candidate_text(candidate);
        if !text.is_empty() {
            let delta = if self.sent_role {
                json!({ "content": text })
            } else {
                self.sent_role = true;
                json!({ "role": "assistant", "content": text })
            };
            out.push_back(self.header.chunk(delta, None));
        }

        let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) else {
            return Step::Continue;
        };
        out.push_back(
            self.header
                .chunk(json!({}), Some(finish_reason_to_chat(Some(reason)))),
        );
        if let Some(usage) = self.usage.as_ref() {
            out.push_back(self.header.usage_chunk(usage));
        }
        Step::Finished(self.usage.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StopSequences;

    #[test]
    fn body_maps_roles_system_and_generation_config() {
        let mut request = ChatCompletionRequest::new(
            "gemini-2.0-flash",
            vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
            ],
        );
        request.max_tokens = Some(64);
        request.stop = Some(StopSequences::Many(vec!["x".to_string()]));

        let body = Google::request_body(&request);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["text"], "hello");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 64);
        assert_eq!(body["generationConfig"]["stopSequences"], json!(["x"]));
    }

    #[test]
    fn last_usage_metadata_wins_and_finish_terminates() {
        let mut translator = CandidateTranslator::new("gemini-2.0-flash");
        let mut out = VecDeque::new();

        let step = translator.on_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"He"}],"role":"model"}}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":1}}"#,
            &mut out,
        );
        assert!(matches!(step, Step::Continue));

        let step = translator.on_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"llo"}],"role":"model"},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2}}"#,
            &mut out,
        );
        match step {
            Step::Finished(Some(usage)) => {
                assert_eq!(usage.input_tokens, 4);
                assert_eq!(usage.output_tokens, 2);
            }
            other => panic!("unexpected step: {other:?}"),
        }
        // two content chunks, finish chunk, usage chunk
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn finish_without_usage_metadata_finishes_without_usage() {
        let mut translator = CandidateTranslator::new("gemini-3-flash");
        let mut out = VecDeque::new();
        let step = translator.on_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"x"}]},"finishReason":"MAX_TOKENS"}]}"#,
            &mut out,
        );
        assert!(matches!(step, Step::Finished(None)));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn null_error_field_is_not_a_failure() {
        let mut translator = CandidateTranslator::new("gemini-2.0-flash");
        let mut out = VecDeque::new();
        let step = translator.on_data(
            r#"{"error":null,"candidates":[{"content":{"parts":[{"text":"ok"}]}}]}"#,
            &mut out,
        );
        assert!(matches!(step, Step::Continue));
        assert_eq!(out.len(), 1);

        let step = translator.on_data(r#"{"error":{"code":500,"message":"boom"}}"#, &mut out);
        assert!(matches!(step, Step::Failed(message) if message == "boom"));
    }
}
