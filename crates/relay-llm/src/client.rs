use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::errors::GatewayError;
use relay_core::provider::{ChatProvider, ChatRequest, ChunkStream, CompletionModel};
use relay_core::settings::UpstreamSettings;

use crate::sse::SseChunkStream;

const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: SSE_IDLE_TIMEOUT,
        }
    }

    pub fn from_settings(settings: &UpstreamSettings) -> Self {
        Self {
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone().map(SecretString::from),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            idle_timeout: SSE_IDLE_TIMEOUT,
        }
    }
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatProvider {
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
    idle_timeout: Duration,
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    #[serde(flatten)]
    request: &'a ChatRequest,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatProvider {
    pub fn new(config: ClientConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| GatewayError::InvalidRequest(format!("http client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key,
            idle_timeout: config.idle_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response, GatewayError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("accept", if stream { "text/event-stream" } else { "application/json" })
            .json(&CompletionBody { request, stream });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.idle_timeout)
            } else {
                GatewayError::NetworkError(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkStream, GatewayError> {
        let resp = self.send(request, true).await?;
        Ok(Box::pin(SseChunkStream::new(resp.bytes_stream(), self.idle_timeout)))
    }
}

#[async_trait]
impl CompletionModel for OpenAiCompatProvider {
    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete(&self, request: &ChatRequest) -> Result<String, GatewayError> {
        let resp = self.send(request, false).await?;
        let body: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::MalformedChunk(e.to_string()))?;
        Ok(body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::messages::Message;

    #[test]
    fn endpoint_joins_without_double_slash() {
        let provider = OpenAiCompatProvider::new(ClientConfig::new("http://localhost:8842/")).unwrap();
        assert_eq!(provider.endpoint(), "http://localhost:8842/chat/completions");
    }

    #[test]
    fn body_flattens_request_and_sets_stream() {
        let request = ChatRequest::new("fast", &[Message::user("hi")]);
        let json = serde_json::to_value(CompletionBody { request: &request, stream: true }).unwrap();
        assert_eq!(json["model"], "fast");
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn settings_key_becomes_secret() {
        let settings = UpstreamSettings {
            api_key: Some("sk-test".into()),
            ..Default::default()
        };
        let config = ClientConfig::from_settings(&settings);
        assert_eq!(config.api_key.unwrap().expose_secret(), "sk-test");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn completion_response_reads_first_choice() {
        let raw = r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"{\"needs_thinking\":true}"}}]}"#;
        let body: CompletionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            body.choices[0].message.content.as_deref(),
            Some("{\"needs_thinking\":true}")
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_network_error() {
        let provider = OpenAiCompatProvider::new(ClientConfig::new("http://127.0.0.1:1")).unwrap();
        let request = ChatRequest::new("m", &[Message::user("hi")]);
        let err = match provider.stream_chat(&request).await {
            Err(e) => e,
            Ok(_) => panic!("expected connection failure"),
        };
        assert!(err.is_retryable(), "got {err:?}");
    }
}
