use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use relay_core::chunk::ChatCompletionChunk;
use relay_core::errors::GatewayError;
use relay_core::provider::{ChatProvider, ChatRequest, ChunkStream, CompletionModel};

/// Pre-programmed responses for deterministic testing without network calls.
pub enum MockResponse {
    /// Yield these chunks (or mid-stream errors) back to back.
    Chunks(Vec<Result<ChatCompletionChunk, GatewayError>>),
    /// Yield these items, sleeping `gap` before each one.
    Paced {
        gap: Duration,
        items: Vec<Result<ChatCompletionChunk, GatewayError>>,
    },
    /// Plain assistant text for a non-streaming completion.
    Completion(String),
    /// Fail the call itself.
    Error(GatewayError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Chunks(vec![Ok(ChatCompletionChunk::text(text))])
    }

    pub fn chunks(chunks: Vec<ChatCompletionChunk>) -> Self {
        Self::Chunks(chunks.into_iter().map(Ok).collect())
    }

    pub fn empty() -> Self {
        Self::Chunks(Vec::new())
    }

    pub fn completion(text: &str) -> Self {
        Self::Completion(text.to_string())
    }

    pub fn paced(gap: Duration, chunks: Vec<ChatCompletionChunk>) -> Self {
        Self::Paced {
            gap,
            items: chunks.into_iter().map(Ok).collect(),
        }
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Provider that replays scripted responses in order and records every request.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    fn next_response(&self, request: &ChatRequest) -> Result<MockResponse, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());
        self.responses.lock().pop_front().ok_or_else(|| {
            GatewayError::InvalidRequest(format!("MockProvider: no response configured for call {idx}"))
        })
    }
}

type Items = Vec<Result<ChatCompletionChunk, GatewayError>>;

enum Settled {
    Chunks(Items),
    Paced { gap: Duration, items: Items },
    Completion(String),
}

/// Unroll nested delays iteratively.
async fn settle(mut response: MockResponse) -> Result<Settled, GatewayError> {
    loop {
        match response {
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                response = *inner;
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Chunks(items) => return Ok(Settled::Chunks(items)),
            MockResponse::Paced { gap, items } => return Ok(Settled::Paced { gap, items }),
            MockResponse::Completion(text) => return Ok(Settled::Completion(text)),
        }
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkStream, GatewayError> {
        let response = self.next_response(request)?;
        match settle(response).await? {
            Settled::Chunks(items) => Ok(Box::pin(stream::iter(items))),
            Settled::Paced { gap, items } => Ok(Box::pin(async_stream::stream! {
                for item in items {
                    tokio::time::sleep(gap).await;
                    yield item;
                }
            })),
            Settled::Completion(text) => {
                Ok(Box::pin(stream::iter(vec![Ok(ChatCompletionChunk::text(&text))])))
            }
        }
    }
}

#[async_trait]
impl CompletionModel for MockProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<String, GatewayError> {
        let response = self.next_response(request)?;
        match settle(response).await? {
            Settled::Completion(text) => Ok(text),
            Settled::Chunks(items) | Settled::Paced { items, .. } => {
                let mut text = String::new();
                for item in items {
                    let chunk = item?;
                    for choice in chunk.choices {
                        if let Some(content) = choice.delta.content {
                            text.push_str(&content);
                        }
                    }
                }
                Ok(text)
            }
        }
    }
}
