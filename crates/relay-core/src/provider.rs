use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;

use crate::chunk::ChatCompletionChunk;
use crate::errors::GatewayError;
use crate::messages::{Message, RunInput};

/// Lazily produced chunks from one streaming completion.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatCompletionChunk, GatewayError>> + Send>>;

#[derive(Clone, Debug, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Body of a chat completion request, minus the `stream` flag the client adds.
#[derive(Clone, Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: &[Message]) -> Self {
        Self {
            model: model.into(),
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn for_run(model: impl Into<String>, input: &RunInput) -> Self {
        Self::new(model, &input.messages)
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Streaming chat-completion endpoint. Each call is an independent request.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkStream, GatewayError>;
}

/// Non-streaming completion returning only the assistant text.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_roles_and_model() {
        let req = ChatRequest::new("main", &[Message::system("s"), Message::user("hi")])
            .with_temperature(0.0);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["model"], "main");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["temperature"], 0.0);
        assert!(json.get("max_tokens").is_none());
    }
}
