use std::collections::VecDeque;

use bytes::Bytes;
use serde_json::Value;

use super::stream::{FrameStream, Step, StreamTranslator, passthrough_bytes, translate_sse};
use super::{Completion, Credential, ProviderKind};
use crate::Result;
use crate::types::{ChatCompletionRequest, UsageResult};
use crate::utils::http::{send_checked, send_checked_json};
use crate::utils::sse::sse_data_stream_from_response;

/// Client for vendors that already speak the chat-completions protocol
/// (OpenAI and xAI). Responses and chunks are forwarded unchanged.
#[derive(Clone, Debug)]
pub struct OpenAiCompatible {
    kind: ProviderKind,
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiCompatible {
    pub fn new(kind: ProviderKind, http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            kind,
            http,
            base_url: base_url.into(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request_body(request: &ChatCompletionRequest, stream: bool) -> Result<Value> {
        let mut body = serde_json::to_value(request)?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(stream));
            if stream {
                obj.insert(
                    "stream_options".to_string(),
                    serde_json::json!({ "include_usage": true }),
                );
            }
        }
        Ok(body)
    }

    pub async fn complete(
        &self,
        request: &ChatCompletionRequest,
        credential: &Credential,
    ) -> Result<Completion> {
        let body = Self::request_body(request, false)?;
        let response: Value = send_checked_json(
            self.http
                .post(self.chat_completions_url())
                .bearer_auth(credential.expose())
                .json(&body),
        )
        .await?;

        let usage = response
            .get("usage")
            .and_then(parse_usage)
            .unwrap_or_else(|| UsageResult::new(0, 0, Value::Null));
        Ok(Completion { response, usage })
    }

    pub async fn stream(
        &self,
        request: &ChatCompletionRequest,
        credential: &Credential,
    ) -> Result<FrameStream> {
        let body = Self::request_body(request, true)?;
        let response = send_checked(
            self.http
                .post(self.chat_completions_url())
                .bearer_auth(credential.expose())
                .header("accept", "text/event-stream")
                .json(&body),
        )
        .await?;

        let data_stream = sse_data_stream_from_response(response);
        Ok(translate_sse(data_stream, PassthroughTranslator::default()))
    }
}

pub(crate) fn parse_usage(usage: &Value) -> Option<UsageResult> {
    let obj = usage.as_object()?;
    let input_tokens = obj.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
    let output_tokens = obj
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(UsageResult::new(input_tokens, output_tokens, usage.clone()))
}

/// Forwards vendor chunks verbatim. Usage arrives on the last chunk before
/// the `[DONE]` marker and is paired with the terminal frame.
#[derive(Debug, Default)]
struct PassthroughTranslator {
    usage: Option<UsageResult>,
}

impl StreamTranslator for PassthroughTranslator {
    fn on_data(&mut self, data: &str, out: &mut VecDeque<Bytes>) -> Step {
        if data.trim() == "[DONE]" {
            return Step::Finished(self.usage.take());
        }

        let chunk = match serde_json::from_str::<Value>(data) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::debug!(error = %err, "skipping unparseable chunk");
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

        if let Some(usage) = chunk.get("usage").and_then(parse_usage) {
            self.usage = Some(usage);
        }
        out.push_back(passthrough_bytes(data));
        Step::Continue
    }
}
