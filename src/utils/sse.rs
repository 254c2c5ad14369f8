use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio_util::io::StreamReader;

use crate::{Result, VuzoError};

const MAX_LINE_BYTES: usize = 256 * 1024;
const MAX_EVENT_BYTES: usize = 4 * 1024 * 1024;

/// The `data:` payloads of an SSE response body, one item per event. The
/// `[DONE]` marker comes through like any other payload.
pub fn sse_data_stream_from_response(
    response: reqwest::Response,
) -> BoxStream<'static, Result<String>> {
    let body = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));
    data_events(BufReader::new(body))
}

fn data_events<R>(reader: R) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        EventReader::new(reader),
        |mut events| async move {
            let data = events.next_data().await?;
            Ok::<_, VuzoError>(data.map(|data| (data, events)))
        },
    ))
}

struct EventReader<R> {
    reader: R,
    line: Vec<u8>,
    data: String,
}

impl<R> EventReader<R>
where
    R: AsyncBufRead + Unpin,
{
    fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
            data: String::new(),
        }
    }

    /// Joins the `data:` lines of the next event. Other fields and lines that
    /// are not UTF-8 are skipped.
    async fn next_data(&mut self) -> Result<Option<String>> {
        self.data.clear();
        loop {
            if !self.read_line().await? {
                return Ok((!self.data.is_empty()).then(|| std::mem::take(&mut self.data)));
            }

            let Ok(line) = std::str::from_utf8(&self.line) else {
                tracing::debug!("skipping SSE line with invalid UTF-8");
                continue;
            };
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if self.data.is_empty() {
                    continue;
                }
                return Ok(Some(std::mem::take(&mut self.data)));
            }

            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim_start();
            if self.data.len() + 1 + payload.len() > MAX_EVENT_BYTES {
                return Err(VuzoError::InvalidResponse(format!(
                    "SSE event exceeds {MAX_EVENT_BYTES} bytes"
                )));
            }
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(payload);
        }
    }

    /// Reads one line into `self.line`; false at end of input.
    async fn read_line(&mut self) -> Result<bool> {
        self.line.clear();
        let read = (&mut self.reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut self.line)
            .await
            .map_err(|err| VuzoError::InvalidResponse(format!("failed to read SSE line: {err}")))?;
        if self.line.len() > MAX_LINE_BYTES {
            return Err(VuzoError::InvalidResponse(format!(
                "SSE line exceeds {MAX_LINE_BYTES} bytes"
            )));
        }
        Ok(read > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::StreamExt;

    fn events(chunks: Vec<Bytes>) -> BoxStream<'static, Result<String>> {
        let body = stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
        data_events(BufReader::new(StreamReader::new(body)))
    }

    async fn collect(chunks: &[&'static [u8]]) -> Result<Vec<String>> {
        events(chunks.iter().copied().map(Bytes::from_static).collect())
            .try_collect()
            .await
    }

    #[tokio::test]
    async fn joins_data_lines_and_keeps_done_marker() -> Result<()> {
        let out = collect(&[
            b"event: message\ndata: {\"hello\":1}\n\n",
            b"data: line1\ndata: line2\n\n",
            b": keep-alive\n\n",
            b"data: [DONE]\n\n",
        ])
        .await?;

        assert_eq!(out, vec!["{\"hello\":1}", "line1\nline2", "[DONE]"]);
        Ok(())
    }

    #[tokio::test]
    async fn events_split_across_reads_are_reassembled() -> Result<()> {
        let out = collect(&[b"da", b"ta: {\"a\"", b":1}\r\n", b"\r\n", b"data: tail"]).await?;
        assert_eq!(out, vec!["{\"a\":1}", "tail"]);
        Ok(())
    }

    #[tokio::test]
    async fn skips_lines_with_invalid_utf8() -> Result<()> {
        let out = collect(&[b"data: \xff\xfe\n\n", b"data: ok\n\n"]).await?;
        assert_eq!(out, vec!["ok"]);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_lines_are_an_error() {
        let sse = format!("data: {}\n\n", "x".repeat(MAX_LINE_BYTES));
        let mut data = events(vec![Bytes::from(sse)]);
        let err = data
            .next()
            .await
            .expect("one item")
            .expect_err("line too long");
        assert!(err.to_string().contains("SSE line exceeds"));
    }
}
