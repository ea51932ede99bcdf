use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Future, Stream, StreamExt};

use relay_core::chunk::ChatCompletionChunk;
use relay_core::errors::GatewayError;

/// Payload that ends an OpenAI-style stream.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, PartialEq)]
pub enum SseFrame {
    Chunk(ChatCompletionChunk),
    Done,
}

/// Incremental decoder for `data:` framed server-sent events.
///
/// Byte chunks may split lines (and UTF-8 sequences) anywhere; only complete
/// lines are decoded. Multiple `data:` lines of one event are joined with `\n`.
/// `event:`, `id:`, `retry:` and comment lines are ignored.
#[derive(Default)]
pub struct SseDecoder {
    bytes: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<SseFrame, GatewayError>> {
        self.bytes.extend_from_slice(chunk);
        let Some(last_newline) = self.bytes.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let complete: Vec<u8> = self.bytes.drain(..=last_newline).collect();
        let text = String::from_utf8_lossy(&complete);
        let text = text.strip_suffix('\n').unwrap_or(&text);

        let mut frames = Vec::new();
        for line in text.split('\n') {
            if let Some(frame) = self.line(line.trim_end_matches('\r')) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush whatever is left once the byte stream has ended.
    pub fn finish(&mut self) -> Option<Result<SseFrame, GatewayError>> {
        if !self.bytes.is_empty() {
            let rest = std::mem::take(&mut self.bytes);
            let text = String::from_utf8_lossy(&rest).into_owned();
            if let Some(frame) = self.line(text.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        self.flush()
    }

    fn line(&mut self, line: &str) -> Option<Result<SseFrame, GatewayError>> {
        if line.is_empty() {
            return self.flush();
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
        None
    }

    fn flush(&mut self) -> Option<Result<SseFrame, GatewayError>> {
        if self.data.is_empty() {
            return None;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        Some(decode_data(&payload))
    }
}

pub fn decode_data(payload: &str) -> Result<SseFrame, GatewayError> {
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return Ok(SseFrame::Done);
    }
    serde_json::from_str(payload)
        .map(SseFrame::Chunk)
        .map_err(|e| GatewayError::MalformedChunk(format!("{e}: {payload}")))
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

/// Turns an HTTP body into completion chunks.
///
/// Ends after `[DONE]` or when the body ends. A transport error or an idle gap
/// longer than the configured timeout yields one error and ends the stream.
pub struct SseChunkStream {
    inner: ByteStream,
    decoder: SseDecoder,
    pending: VecDeque<Result<ChatCompletionChunk, GatewayError>>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseChunkStream {
    pub fn new<S, E>(byte_stream: S, idle_timeout: Duration) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        Self {
            inner: Box::pin(byte_stream.map(|r| r.map_err(|e| e.to_string()))),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn absorb(&mut self, frames: impl IntoIterator<Item = Result<SseFrame, GatewayError>>) {
        for frame in frames {
            if self.finished {
                break;
            }
            match frame {
                Ok(SseFrame::Chunk(chunk)) => self.pending.push_back(Ok(chunk)),
                Ok(SseFrame::Done) => self.finished = true,
                Err(e) => {
                    self.pending.push_back(Err(e));
                    self.finished = true;
                }
            }
        }
    }
}

impl Stream for SseChunkStream {
    type Item = Result<ChatCompletionChunk, GatewayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Some(item) = this.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + this.idle_duration;
                    this.idle_deadline.as_mut().reset(deadline);
                    let frames = this.decoder.push(&bytes);
                    this.absorb(frames);
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(GatewayError::StreamInterrupted(e))));
                }
                Poll::Ready(None) => {
                    let tail = this.decoder.finish();
                    this.absorb(tail);
                    this.finished = true;
                }
                Poll::Pending => {
                    if this.idle_deadline.as_mut().poll(cx).is_ready() {
                        this.finished = true;
                        return Poll::Ready(Some(Err(GatewayError::Timeout(this.idle_duration))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn body(parts: &[&str]) -> impl Stream<Item = Result<Bytes, String>> + Send + 'static {
        let owned: Vec<Result<Bytes, String>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        stream::iter(owned)
    }

    #[test]
    fn decoder_handles_split_lines() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"choices\":[{\"delta\"").is_empty());
        let frames = decoder.push(b":{\"content\":\"hi\"}}]}\n\n");
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Ok(SseFrame::Chunk(chunk)) => {
                assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hi"));
            }
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn decoder_recognises_done_and_ignores_comments() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keep-alive\n\nevent: message\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Ok(SseFrame::Done)));
    }

    #[test]
    fn decoder_accepts_crlf_and_missing_space() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data:{\"choices\":[]}\r\n\r\n");
        assert!(matches!(frames[0], Ok(SseFrame::Chunk(_))));
    }

    #[test]
    fn decoder_flushes_unterminated_tail() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert!(matches!(decoder.finish(), Some(Ok(SseFrame::Done))));
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn malformed_payload_is_reported() {
        let err = decode_data("{oops").unwrap_err();
        assert!(matches!(err, GatewayError::MalformedChunk(_)));
    }

    #[tokio::test]
    async fn stream_stops_at_done() {
        let s = SseChunkStream::new(
            body(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\ndata: [DONE]\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"after\"}}]}\n\n",
            ]),
            Duration::from_secs(5),
        );
        let items: Vec<_> = s.collect().await;
        assert_eq!(items.len(), 2);
        let texts: Vec<String> = items
            .into_iter()
            .map(|c| c.unwrap().choices[0].delta.content.clone().unwrap())
            .collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn transport_error_ends_stream() {
        let parts: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[]}\n\n")),
            Err("connection reset".into()),
            Ok(Bytes::from_static(b"data: {\"choices\":[]}\n\n")),
        ];
        let items: Vec<_> = SseChunkStream::new(stream::iter(parts), Duration::from_secs(5))
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(GatewayError::StreamInterrupted(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_body_times_out() {
        let s = SseChunkStream::new(
            stream::pending::<Result<Bytes, String>>(),
            Duration::from_secs(3),
        );
        let items: Vec<_> = s.collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(GatewayError::Timeout(_))));
    }
}
