use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use tracing::warn;

use relay_core::events::{Event, EventStream};
use relay_core::ids::SessionId;
use relay_core::messages::RunInput;
use relay_core::provider::ChatProvider;

use crate::archive::StateArchive;
use crate::heartbeat::HeartbeatMerger;
use crate::sessions::SharedController;
use crate::translator::DeltaTranslator;

/// Name of the signal carrying the adaptive state, sent right after `RunStarted`.
pub const ADAPTIVE_STATE_SIGNAL: &str = "AdaptiveState";

/// Anything that turns a [`RunInput`] into a run's event stream.
pub trait Agent: Send + Sync {
    fn run(&self, input: RunInput) -> EventStream;
}

/// A chat-completions backend with heartbeats merged into its output.
#[derive(Clone)]
pub struct ProviderAgent {
    translator: DeltaTranslator,
    heartbeat: HeartbeatMerger,
}

impl ProviderAgent {
    pub fn new(provider: Arc<dyn ChatProvider>, model: impl Into<String>, heartbeat: HeartbeatMerger) -> Self {
        Self {
            translator: DeltaTranslator::new(provider, model),
            heartbeat,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.translator = self.translator.with_system_prompt(prompt);
        self
    }

    pub fn model(&self) -> &str {
        self.translator.model()
    }
}

impl Agent for ProviderAgent {
    fn run(&self, input: RunInput) -> EventStream {
        let events = self.translator.translate(&input);
        self.heartbeat.merge(events, input.thread_id, input.run_id)
    }
}

/// Picks the model for each run through the session's adaptive controller,
/// then streams that model's reply the way a [`ProviderAgent`] would.
pub struct AdaptiveAgent {
    controller: SharedController,
    provider: Arc<dyn ChatProvider>,
    heartbeat: HeartbeatMerger,
    system_prompt: Option<String>,
    archive: Option<(Arc<StateArchive>, SessionId)>,
}

impl AdaptiveAgent {
    pub fn new(controller: SharedController, provider: Arc<dyn ChatProvider>, heartbeat: HeartbeatMerger) -> Self {
        Self {
            controller,
            provider,
            heartbeat,
            system_prompt: None,
            archive: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    /// Save the session's state after every controller update.
    pub fn with_archive(mut self, archive: Arc<StateArchive>, session_id: SessionId) -> Self {
        self.archive = Some((archive, session_id));
        self
    }
}

impl Agent for AdaptiveAgent {
    /// `RunStarted` goes out before the controller consults reflection, and the
    /// whole run, reflection included, is covered by heartbeats.
    fn run(&self, input: RunInput) -> EventStream {
        let controller = Arc::clone(&self.controller);
        let provider = Arc::clone(&self.provider);
        let system_prompt = self.system_prompt.clone();
        let archive = self.archive.clone();
        let thread_id = input.thread_id.clone();
        let run_id = input.run_id.clone();

        let main: EventStream = Box::pin(stream! {
            yield Event::RunStarted {
                thread_id: input.thread_id.clone(),
                run_id: input.run_id.clone(),
            };

            let state = controller.lock().await.invoke(&input).await.clone();

            if let Some((archive, session_id)) = &archive {
                if let Err(e) = archive.save(session_id, &state).await {
                    warn!(%session_id, error = %e, "failed to archive adaptive state");
                }
            }

            match serde_json::to_value(state.summary()) {
                Ok(payload) => {
                    yield Event::CustomSignal {
                        name: ADAPTIVE_STATE_SIGNAL.to_string(),
                        payload,
                    };
                }
                Err(e) => warn!(error = %e, "failed to serialize adaptive state"),
            }

            let mut translator = DeltaTranslator::new(provider, state.current_model.clone());
            if let Some(prompt) = system_prompt {
                translator = translator.with_system_prompt(prompt);
            }
            let mut events = translator.translate_after_start(&input);
            while let Some(event) = events.next().await {
                yield event;
            }
        });

        self.heartbeat.merge(main, thread_id, run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::Mutex;

    use relay_core::chunk::ChatCompletionChunk;
    use relay_core::messages::Message;
    use relay_llm::{MockProvider, MockResponse};

    use crate::adaptive::{AdaptiveConfig, AdaptiveController};
    use crate::reflection::ReflectionService;

    fn heartbeat() -> HeartbeatMerger {
        HeartbeatMerger::new(Duration::from_secs(1), Duration::from_millis(100))
    }

    fn conversation(users: usize) -> RunInput {
        let mut messages = Vec::new();
        for i in 0..users {
            messages.push(Message::user(format!("q{i}")));
            if i + 1 < users {
                messages.push(Message::assistant(format!("a{i}")));
            }
        }
        RunInput::new("t1".into(), "r1".into(), messages)
    }

    fn controller(reflection_replies: Vec<MockResponse>) -> SharedController {
        let reflection = Arc::new(ReflectionService::new(
            Arc::new(MockProvider::new(reflection_replies)),
            "reflect",
        ));
        let config = AdaptiveConfig {
            main_model: "main".into(),
            fast_model: "fast".into(),
            enable_adaptive_thinking: true,
            max_turns: 3,
        };
        Arc::new(Mutex::new(AdaptiveController::new(config, reflection)))
    }

    #[tokio::test(start_paused = true)]
    async fn provider_agent_interleaves_heartbeats_for_slow_upstream() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::paced(
            Duration::from_millis(2_500),
            vec![ChatCompletionChunk::text("slow")],
        )]));
        let agent = ProviderAgent::new(provider, "fast", heartbeat());
        let events: Vec<Event> = agent.run(conversation(1)).collect().await;

        assert!(matches!(events.first(), Some(Event::RunStarted { .. })));
        assert!(matches!(events.last(), Some(Event::RunFinished { .. })));
        assert!(events.iter().filter(|e| e.is_heartbeat()).count() >= 1);
    }

    #[tokio::test]
    async fn adaptive_agent_reports_state_after_run_started() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text("sure")]));
        let agent = AdaptiveAgent::new(controller(vec![]), provider.clone(), heartbeat());
        let events: Vec<Event> = agent.run(conversation(1)).collect().await;

        assert!(matches!(events[0], Event::RunStarted { .. }));
        match &events[1] {
            Event::CustomSignal { name, payload } => {
                assert_eq!(name, ADAPTIVE_STATE_SIGNAL);
                assert_eq!(payload["thinkMode"], false);
                assert_eq!(payload["currentModel"], "fast");
                assert_eq!(payload["turnCount"], 1);
            }
            other => panic!("expected adaptive state signal, got {other:?}"),
        }
        assert_eq!(provider.requests()[0].model, "fast");
    }

    #[tokio::test]
    async fn correction_routes_the_run_to_the_main_model() {
        let verdict = r#"{"needs_thinking": true, "reason": "correction", "confidence": 0.9}"#;
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text("let me think")]));
        let shared = controller(vec![MockResponse::completion(verdict)]);
        let agent = AdaptiveAgent::new(Arc::clone(&shared), provider.clone(), heartbeat());

        let events: Vec<Event> = agent.run(conversation(3)).collect().await;
        assert!(matches!(events.last(), Some(Event::RunFinished { .. })));
        assert_eq!(provider.requests()[0].model, "main");
        assert!(shared.lock().await.state().think_mode);
    }

    #[tokio::test]
    async fn archive_receives_the_updated_state() {
        let archive = Arc::new(StateArchive::in_memory().unwrap());
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text("hi")]));
        let agent = AdaptiveAgent::new(controller(vec![]), provider, heartbeat())
            .with_archive(Arc::clone(&archive), "sess_a".into());

        let _: Vec<Event> = agent.run(conversation(2)).collect().await;
        let saved = archive.load(&"sess_a".into()).await.unwrap().expect("saved");
        assert_eq!(saved.turn_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reflection_is_covered_by_run_started_and_heartbeats() {
        let verdict = r#"{"needs_thinking": true, "reason": "correction", "confidence": 0.9}"#;
        let shared = controller(vec![MockResponse::delayed(
            Duration::from_secs(600),
            MockResponse::completion(verdict),
        )]);
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text("answer")]));
        let agent = AdaptiveAgent::new(Arc::clone(&shared), provider.clone(), heartbeat());

        let mut events = agent.run(conversation(3));
        let first = tokio::time::timeout(Duration::from_millis(10), events.next())
            .await
            .expect("run announced before reflection finishes");
        assert!(matches!(first, Some(Event::RunStarted { .. })));

        let rest: Vec<Event> = tokio::time::timeout(Duration::from_secs(120), events.collect())
            .await
            .expect("reflection timeout ends the wait");
        let signal = rest
            .iter()
            .position(|e| matches!(e, Event::CustomSignal { .. }))
            .expect("adaptive state signal");
        let beats = rest[..signal].iter().filter(|e| e.is_heartbeat()).count();
        assert!(beats >= 25, "expected heartbeats while reflecting, got {beats}");
        assert!(matches!(rest.last(), Some(Event::RunFinished { .. })));

        assert_eq!(provider.requests()[0].model, "fast");
        let state = shared.lock().await.state().clone();
        assert!(!state.think_mode);
        assert!(state
            .last_reflection
            .is_some_and(|r| r.reason.starts_with("Service error")));
    }
}
