use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use relay_core::errors::GatewayError;
use relay_core::provider::{ChatProvider, ChatRequest, ChunkStream, CompletionModel};
use relay_core::settings::UpstreamSettings;

#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.2,
        }
    }
}

impl ReliableConfig {
    pub fn from_settings(settings: &UpstreamSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            ..Default::default()
        }
    }
}

/// Retries opening a completion with exponential backoff and jitter.
///
/// Only the request that opens a stream is retried. Once chunks start flowing
/// the stream is committed and mid-stream errors surface to the caller.
pub struct ReliableProvider<P> {
    inner: P,
    config: ReliableConfig,
    total_retries: AtomicU64,
}

impl<P> ReliableProvider<P> {
    pub fn new(inner: P, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }

        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    async fn with_retries<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || attempt >= self.config.max_retries => return Err(e),
                Err(e) => {
                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        op,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl<P: ChatProvider> ChatProvider for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkStream, GatewayError> {
        self.with_retries("stream_chat", || self.inner.stream_chat(request))
            .await
    }
}

#[async_trait]
impl<P: CompletionModel> CompletionModel for ReliableProvider<P> {
    async fn complete(&self, request: &ChatRequest) -> Result<String, GatewayError> {
        self.with_retries("complete", || self.inner.complete(request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockProvider, MockResponse};
    use relay_core::messages::Message;

    fn request() -> ChatRequest {
        ChatRequest::new("m", &[Message::user("hi")])
    }

    fn fast_config(max_retries: u32) -> ReliableConfig {
        ReliableConfig {
            max_retries,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn server_error() -> MockResponse {
        MockResponse::Error(GatewayError::ServerError {
            status: 500,
            body: "internal".into(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn retries_retryable_errors_until_success() {
        let mock = MockProvider::new(vec![server_error(), server_error(), MockResponse::text("ok")]);
        let reliable = ReliableProvider::new(mock, fast_config(3));

        assert!(reliable.stream_chat(&request()).await.is_ok());
        assert_eq!(reliable.total_retries(), 2);
        assert_eq!(reliable.inner().call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let mock = MockProvider::new(vec![
            MockResponse::Error(GatewayError::AuthenticationFailed("bad key".into())),
            MockResponse::text("unreachable"),
        ]);
        let reliable = ReliableProvider::new(mock, fast_config(3));

        let err = reliable.stream_chat(&request()).await.err().expect("expected error");
        assert!(matches!(err, GatewayError::AuthenticationFailed(_)));
        assert_eq!(reliable.total_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let mock = MockProvider::new(vec![server_error(), server_error(), server_error()]);
        let reliable = ReliableProvider::new(mock, fast_config(2));

        let err = reliable.stream_chat(&request()).await.err().expect("expected error");
        assert!(matches!(err, GatewayError::ServerError { .. }));
        assert_eq!(reliable.total_retries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_calls_are_retried_too() {
        let mock = MockProvider::new(vec![
            MockResponse::Error(GatewayError::NetworkError("reset".into())),
            MockResponse::completion("{\"needs_thinking\": false}"),
        ]);
        let reliable = ReliableProvider::new(mock, fast_config(1));

        let text = reliable.complete(&request()).await.unwrap();
        assert!(text.contains("needs_thinking"));
        assert_eq!(reliable.total_retries(), 1);
    }

    #[test]
    fn delay_doubles_and_caps_without_jitter() {
        let reliable = ReliableProvider::new(
            MockProvider::new(vec![]),
            ReliableConfig {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(300),
                jitter_factor: 0.0,
                ..Default::default()
            },
        );
        assert_eq!(reliable.retry_delay(0, None), Duration::from_millis(100));
        assert_eq!(reliable.retry_delay(1, None), Duration::from_millis(200));
        assert_eq!(reliable.retry_delay(5, None), Duration::from_millis(300));
        assert_eq!(
            reliable.retry_delay(0, Some(Duration::from_secs(4))),
            Duration::from_secs(4)
        );
    }

    #[test]
    fn jitter_stays_within_band() {
        let reliable = ReliableProvider::new(
            MockProvider::new(vec![]),
            ReliableConfig {
                base_delay: Duration::from_millis(1000),
                jitter_factor: 0.2,
                ..Default::default()
            },
        );
        for _ in 0..100 {
            let d = reliable.retry_delay(0, None).as_millis();
            assert!((800..=1200).contains(&d), "delay {d} outside band");
        }
    }
}
