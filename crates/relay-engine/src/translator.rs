use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use tracing::{error, info, warn};

use relay_core::chunk::ChatCompletionChunk;
use relay_core::errors::GatewayError;
use relay_core::events::{Event, EventStream};
use relay_core::ids::{MessageId, ToolCallId};
use relay_core::messages::{Role, RunInput};
use relay_core::provider::{ChatMessage, ChatProvider, ChatRequest};

/// Text of the `RunError` emitted when upstream closes without sending a chunk.
pub const EMPTY_STREAM_MESSAGE: &str =
    "No response received from the agent. Please check if agent supports streaming.";

/// Turns one streaming completion into the run's [`Event`] sequence.
///
/// The output always starts with `RunStarted` and ends with exactly one of
/// `RunFinished` or `RunError`. Upstream failures never escape as errors.
#[derive(Clone)]
pub struct DeltaTranslator {
    provider: Arc<dyn ChatProvider>,
    model: String,
    system_prompt: Option<String>,
}

impl DeltaTranslator {
    pub fn new(provider: Arc<dyn ChatProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            system_prompt: None,
        }
    }

    /// Prepended when the inbound conversation carries no system message of its own.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_for(&self, input: &RunInput) -> ChatRequest {
        let mut request = ChatRequest::for_run(&self.model, input);
        if let Some(prompt) = &self.system_prompt {
            if !input.messages.iter().any(|m| m.role == Role::System) {
                request.messages.insert(
                    0,
                    ChatMessage {
                        role: Role::System.as_str().to_string(),
                        content: prompt.clone(),
                    },
                );
            }
        }
        request
    }

    /// Lazy: nothing is requested upstream until the stream is first polled.
    pub fn translate(&self, input: &RunInput) -> EventStream {
        let started = Event::RunStarted {
            thread_id: input.thread_id.clone(),
            run_id: input.run_id.clone(),
        };
        Box::pin(futures::stream::iter([started]).chain(self.translate_after_start(input)))
    }

    /// Everything [`translate`](Self::translate) emits after `RunStarted`, for
    /// callers that announce the run themselves.
    pub fn translate_after_start(&self, input: &RunInput) -> EventStream {
        let provider = Arc::clone(&self.provider);
        let request = self.request_for(input);
        let thread_id = input.thread_id.clone();
        let run_id = input.run_id.clone();

        Box::pin(stream! {
            let mut chunks = match provider.stream_chat(&request).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    error!(provider = provider.name(), model = %request.model, error = %e, "failed to open upstream stream");
                    yield Event::run_error(e.to_string());
                    return;
                }
            };

            let mut state = RunTranslation::new();
            while let Some(item) = chunks.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        error!(%run_id, error = %e, "upstream stream failed");
                        yield Event::run_error(e.to_string());
                        return;
                    }
                };
                match state.apply(chunk) {
                    Ok(events) => {
                        for event in events {
                            yield event;
                        }
                    }
                    Err(e) => {
                        error!(%run_id, error = %e, "upstream sent an invalid event");
                        yield Event::run_error(e.to_string());
                        return;
                    }
                }
            }

            if state.chunks_seen == 0 {
                warn!(%thread_id, %run_id, "upstream stream ended without any chunks");
                yield Event::run_error(EMPTY_STREAM_MESSAGE);
                return;
            }

            if state.message_started {
                yield Event::TextMessageEnd {
                    message_id: state.message_id.clone(),
                };
            }
            yield Event::RunFinished { thread_id, run_id };
        })
    }
}

/// Per-run bookkeeping: one message id for the whole run, opened at most once.
struct RunTranslation {
    message_id: MessageId,
    message_started: bool,
    chunks_seen: usize,
}

impl RunTranslation {
    fn new() -> Self {
        Self {
            message_id: MessageId::new(),
            message_started: false,
            chunks_seen: 0,
        }
    }

    fn apply(&mut self, chunk: ChatCompletionChunk) -> Result<Vec<Event>, GatewayError> {
        self.chunks_seen += 1;

        if let Some(raw) = chunk.event {
            let event: Event = serde_json::from_value(raw)
                .map_err(|e| GatewayError::MalformedChunk(format!("embedded event: {e}")))?;
            if !event.is_content_delta() {
                info!(event_type = event.event_type(), "forwarding embedded event");
            }
            return Ok(vec![event]);
        }

        let mut choices = chunk.choices.into_iter();
        let Some(choice) = choices.next() else {
            return Ok(Vec::new());
        };
        let extra = choices.count();
        if extra > 0 {
            warn!(choices = extra + 1, "chunk carries several choices, using the first");
        }

        let mut events = Vec::new();
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            if !self.message_started {
                self.message_started = true;
                events.push(Event::TextMessageStart {
                    message_id: self.message_id.clone(),
                });
            }
            events.push(Event::TextMessageDelta {
                message_id: self.message_id.clone(),
                text,
            });
        }

        for fragment in choice.delta.tool_calls.unwrap_or_default() {
            let (name, args_delta) = match fragment.function {
                Some(f) => (f.name, f.arguments),
                None => (None, None),
            };
            events.push(Event::ToolCallDelta {
                tool_call_id: fragment.id.map(ToolCallId::from_raw),
                parent_message_id: Some(self.message_id.clone()),
                name,
                args_delta,
            });
        }

        Ok(events)
    }
}
