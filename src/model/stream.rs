//! Server-sent-events decoding for streamed chat completions.

use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;

use super::client::ModelError;

/// Lazy, finite sequence of text fragments from one model call.
///
/// Dropping the stream cancels the underlying request.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

const DONE_MARKER: &str = "[DONE]";

/// Incremental SSE parser yielding `choices[0].delta.content` fragments.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    done: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the end-of-stream marker has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes, returning any complete content fragments.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, ModelError> {
        self.buffer.extend_from_slice(bytes);
        let mut chunks = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.done {
                continue;
            }
            if let Some(chunk) = self.parse_line(&line)? {
                chunks.push(chunk);
            }
        }

        Ok(chunks)
    }

    /// Flush a trailing line without newline and mark the stream finished.
    pub fn finish(&mut self) -> Result<Vec<String>, ModelError> {
        let rest = std::mem::take(&mut self.buffer);
        let chunk = if self.done {
            None
        } else {
            self.parse_line(&rest)?
        };
        self.done = true;
        Ok(chunk.into_iter().collect())
    }

    fn parse_line(&mut self, line: &[u8]) -> Result<Option<String>, ModelError> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let payload = payload.trim();
        if payload == DONE_MARKER {
            self.done = true;
            return Ok(None);
        }
        if payload.is_empty() {
            return Ok(None);
        }

        let value: Value = serde_json::from_str(payload)
            .map_err(|e| ModelError::ParseError(format!("bad stream event: {}", e)))?;
        if let Some(error) = value.get("error") {
            return Err(ModelError::ApiError {
                status: 0,
                message: error.to_string(),
            });
        }

        Ok(value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }
}

/// Turn a byte stream of SSE events into a [`ChunkStream`].
///
/// The stream ends at `[DONE]` or when the body closes; after an error no
/// further items are produced.
pub fn sse_chunks<S, B, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<ModelError> + Send + 'static,
{
    let state = (Box::pin(bytes), SseParser::new(), VecDeque::<String>::new());

    Box::pin(stream::unfold(
        state,
        |(mut bytes, mut parser, mut pending)| async move {
            loop {
                if let Some(chunk) = pending.pop_front() {
                    return Some((Ok(chunk), (bytes, parser, pending)));
                }
                if parser.is_done() {
                    return None;
                }

                let next = match bytes.next().await {
                    Some(Ok(data)) => parser.push(data.as_ref()),
                    Some(Err(e)) => Err(e.into()),
                    None => parser.finish(),
                };
                match next {
                    Ok(chunks) => pending.extend(chunks),
                    Err(e) => {
                        parser.done = true;
                        pending.clear();
                        return Some((Err(e), (bytes, parser, pending)));
                    }
                }
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_handles_split_events() {
        let mut parser = SseParser::new();
        let first = parser
            .push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\ndata: {\"choi")
            .unwrap();
        assert_eq!(first, vec!["Hel"]);

        let second = parser
            .push(b"ces\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: [DONE]\n\n")
            .unwrap();
        assert_eq!(second, vec!["lo"]);
        assert!(parser.is_done());
    }

    #[test]
    fn test_parser_ignores_comments_and_role_deltas() {
        let mut parser = SseParser::new();
        let chunks = parser
            .push(b": keep-alive\n\ndata: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n")
            .unwrap();
        assert!(chunks.is_empty());
        assert!(!parser.is_done());
    }

    #[test]
    fn test_parser_rejects_bad_json() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {oops\n").is_err());
    }

    #[tokio::test]
    async fn test_sse_chunks_stops_at_done() {
        let body: Vec<Result<Vec<u8>, ModelError>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n".to_vec()),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\ndata: [DONE]\n\n".to_vec()),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n".to_vec()),
        ];
        let chunks: Vec<String> = sse_chunks(stream::iter(body))
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_sse_chunks_flushes_unterminated_tail() {
        let body: Vec<Result<Vec<u8>, ModelError>> =
            vec![Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}".to_vec())];
        let chunks: Vec<String> = sse_chunks(stream::iter(body))
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["tail"]);
    }
}
