use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::{Map, Value, json};

use crate::Result;
use crate::types::UsageResult;

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

static COMPLETION_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// One unified SSE frame, paired with usage only when it is the terminal
/// `[DONE]` frame of a stream that reported token counts.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamFrame {
    pub data: Bytes,
    pub usage: Option<UsageResult>,
}

impl StreamFrame {
    pub fn data(data: Bytes) -> Self {
        Self { data, usage: None }
    }

    pub fn done(usage: Option<UsageResult>) -> Self {
        Self {
            data: Bytes::from_static(DONE_FRAME),
            usage,
        }
    }

    pub fn is_done(&self) -> bool {
        self.data.as_ref() == DONE_FRAME
    }
}

pub type FrameStream = BoxStream<'static, StreamFrame>;

/// Outcome of feeding one vendor payload to a [`StreamTranslator`].
#[derive(Debug)]
pub(crate) enum Step {
    Continue,
    Finished(Option<UsageResult>),
    Failed(String),
}

/// Vendor-specific state machine that turns SSE payloads into unified chunk
/// bytes. The driver in [`translate_sse`] owns termination.
pub(crate) trait StreamTranslator: Send + 'static {
    fn on_data(&mut self, data: &str, out: &mut VecDeque<Bytes>) -> Step;
}

/// Drives `translator` over `data_stream`. The resulting stream always ends
/// with exactly one `[DONE]` frame, and stops reading upstream once the
/// vendor signalled its end.
pub(crate) fn translate_sse<T>(
    data_stream: BoxStream<'static, Result<String>>,
    translator: T,
) -> FrameStream
where
    T: StreamTranslator,
{
    let stream = stream::unfold(
        (
            Some(data_stream),
            translator,
            VecDeque::<StreamFrame>::new(),
            VecDeque::<Bytes>::new(),
        ),
        |(mut data_stream, mut translator, mut frames, mut chunks)| async move {
            loop {
                if let Some(frame) = frames.pop_front() {
                    return Some((frame, (data_stream, translator, frames, chunks)));
                }

                let Some(upstream) = data_stream.as_mut() else {
                    return None;
                };

                let step = match upstream.next().await {
                    Some(Ok(data)) => translator.on_data(&data, &mut chunks),
                    Some(Err(err)) => Step::Failed(err.to_string()),
                    None => {
                        tracing::debug!("upstream stream ended without a terminal event");
                        Step::Finished(None)
                    }
                };

                frames.extend(chunks.drain(..).map(StreamFrame::data));
                match step {
                    Step::Continue => {}
                    Step::Finished(usage) => {
                        data_stream = None;
                        frames.push_back(StreamFrame::done(usage));
                    }
                    Step::Failed(message) => {
                        tracing::warn!(error = %message, "upstream stream failed");
                        data_stream = None;
                        frames.push_back(error_frame(&message));
                        frames.push_back(StreamFrame::done(None));
                    }
                }
            }
        },
    );
    Box::pin(stream)
}

pub(crate) fn passthrough_bytes(data: &str) -> Bytes {
    Bytes::from(format!("data: {data}\n\n"))
}

pub(crate) fn error_frame(message: &str) -> StreamFrame {
    let body = json!({
        "error": {
            "message": message,
            "type": "upstream_error",
        }
    });
    StreamFrame::data(passthrough_bytes(&body.to_string()))
}

/// Identity of the unified chunks emitted for one translated stream.
#[derive(Clone, Debug)]
pub(crate) struct ChunkHeader {
    pub id: String,
    pub model: String,
    pub created: u64,
}

impl ChunkHeader {
    pub fn new(model: &str) -> Self {
        Self {
            id: generate_completion_id(),
            model: model.to_string(),
            created: now_epoch_seconds(),
        }
    }

    pub fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Bytes {
        let mut choice = Map::<String, Value>::new();
        choice.insert("index".to_string(), Value::Number(0.into()));
        choice.insert("delta".to_string(), delta);
        choice.insert(
            "finish_reason".to_string(),
            finish_reason
                .map(|reason| Value::String(reason.to_string()))
                .unwrap_or(Value::Null),
        );

        let mut out = self.envelope();
        out.insert(
            "choices".to_string(),
            Value::Array(vec![Value::Object(choice)]),
        );
        passthrough_bytes(&Value::Object(out).to_string())
    }

    pub fn usage_chunk(&self, usage: &UsageResult) -> Bytes {
        let mut out = self.envelope();
        out.insert("choices".to_string(), Value::Array(Vec::new()));
        out.insert("usage".to_string(), usage.to_chat_usage());
        passthrough_bytes(&Value::Object(out).to_string())
    }

    fn envelope(&self) -> Map<String, Value> {
        let mut out = Map::<String, Value>::new();
        out.insert("id".to_string(), Value::String(self.id.clone()));
        out.insert(
            "object".to_string(),
            Value::String("chat.completion.chunk".to_string()),
        );
        out.insert("created".to_string(), Value::Number(self.created.into()));
        out.insert("model".to_string(), Value::String(self.model.clone()));
        out
    }
}

pub(crate) fn generate_completion_id() -> String {
    let seq = COMPLETION_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("chatcmpl-vuzo-{ts_ms}-{seq}")
}

pub(crate) fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VuzoError;

    struct CountingTranslator {
        stop_after: usize,
        seen: usize,
    }

    impl StreamTranslator for CountingTranslator {
        fn on_data(&mut self, data: &str, out: &mut VecDeque<Bytes>) -> Step {
            self.seen += 1;
            out.push_back(passthrough_bytes(data));
            if self.seen == self.stop_after {
                return Step::Finished(Some(UsageResult::new(1, 2, Value::Null)));
            }
            Step::Continue
        }
    }

    fn payloads(items: Vec<crate::Result<String>>) -> BoxStream<'static, crate::Result<String>> {
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn stops_reading_after_terminal_step() {
        let frames: Vec<StreamFrame> = translate_sse(
            payloads(vec![
                Ok("a".to_string()),
                Ok("b".to_string()),
                Ok("never".to_string()),
            ]),
            CountingTranslator {
                stop_after: 2,
                seen: 0,
            },
        )
        .collect()
        .await;

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].data, Bytes::from("data: b\n\n"));
        assert!(frames[2].is_done());
        assert_eq!(frames[2].usage.as_ref().map(|u| u.total_tokens()), Some(3));
        assert!(frames[..2].iter().all(|frame| frame.usage.is_none()));
    }

    #[tokio::test]
    async fn upstream_error_yields_error_frame_then_single_done() {
        let frames: Vec<StreamFrame> = translate_sse(
            payloads(vec![
                Ok("a".to_string()),
                Err(VuzoError::InvalidResponse("reset".to_string())),
            ]),
            CountingTranslator {
                stop_after: 10,
                seen: 0,
            },
        )
        .collect()
        .await;

        assert_eq!(frames.len(), 3);
        assert!(String::from_utf8_lossy(&frames[1].data).contains("upstream_error"));
        assert_eq!(frames.iter().filter(|frame| frame.is_done()).count(), 1);
        assert!(frames[2].is_done() && frames[2].usage.is_none());
    }

    #[tokio::test]
    async fn premature_end_still_emits_done_without_usage() {
        let frames: Vec<StreamFrame> = translate_sse(
            payloads(vec![Ok("a".to_string())]),
            CountingTranslator {
                stop_after: 10,
                seen: 0,
            },
        )
        .collect()
        .await;

        assert_eq!(frames.len(), 2);
        assert!(frames[1].is_done());
        assert!(frames[1].usage.is_none());
    }

    #[test]
    fn usage_chunk_has_empty_choices() {
        let header = ChunkHeader::new("claude-haiku-4-5");
        let bytes = header.usage_chunk(&UsageResult::new(3, 4, Value::Null));
        let text = String::from_utf8_lossy(&bytes);
        let json: Value = serde_json::from_str(
            text.trim_start_matches("data: ").trim_end(),
        )
        .expect("chunk json");
        assert_eq!(json["object"], "chat.completion.chunk");
        assert_eq!(json["choices"], json!([]));
        assert_eq!(json["usage"]["total_tokens"], 7);
    }
}
