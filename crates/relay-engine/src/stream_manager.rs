use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use relay_core::events::Event;
use relay_core::messages::RunInput;

use crate::agent::Agent;
use crate::error::{panic_message, EngineError};

/// What happened to one produced run, reported once the producer finishes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Events the agent produced, including any synthesised terminal event.
    pub produced: usize,
    /// Events that reached the consumer before it went away.
    pub delivered: usize,
    /// Whether the consumer disconnected before the terminal event.
    pub consumer_dropped: bool,
}

/// Decouples event production from consumption.
///
/// Every run is driven by its own spawned task that iterates the agent to
/// completion whether or not anyone is still reading. The consumer side
/// is an unbounded channel; its closure marks the end of the run.
pub struct StreamManager<F> {
    factory: Arc<F>,
}

impl<F> Clone for StreamManager<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<F, A> StreamManager<F>
where
    F: Fn() -> A + Send + Sync + 'static,
    A: Agent + 'static,
{
    /// `factory` builds a fresh agent for every run.
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }

    pub fn run(&self, input: RunInput) -> ManagedRun {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Arc::clone(&self.factory);
        let run_id = input.run_id.clone();

        let handle = tokio::spawn(async move {
            let mut summary = RunSummary::default();
            let produced = AssertUnwindSafe(produce(factory.as_ref(), input, &tx, &mut summary))
                .catch_unwind()
                .await;

            let failure = match produced {
                Ok(true) => None,
                Ok(false) => Some(EngineError::Internal(
                    "Agent stream ended without a terminal event".into(),
                )),
                Err(panic) => {
                    let msg = panic_message(&panic);
                    error!(%run_id, panic = %msg, "agent task panicked");
                    Some(EngineError::Internal(format!("Agent task failed: {msg}")))
                }
            };
            if let Some(e) = failure {
                warn!(%run_id, error = %e, "synthesising terminal RunError");
                summary.produced += 1;
                deliver(&tx, Event::run_error(e.to_string()), &mut summary);
            }

            info!(
                %run_id,
                produced = summary.produced,
                delivered = summary.delivered,
                consumer_dropped = summary.consumer_dropped,
                "run production finished"
            );
            summary
        });

        ManagedRun {
            events: RunEvents { rx },
            handle,
        }
    }
}

/// Returns whether the agent emitted a terminal event.
async fn produce<F, A>(
    factory: &F,
    input: RunInput,
    tx: &mpsc::UnboundedSender<Event>,
    summary: &mut RunSummary,
) -> bool
where
    F: Fn() -> A,
    A: Agent,
{
    let agent = factory();
    let mut events = agent.run(input);
    let mut terminated = false;

    while let Some(event) = events.next().await {
        summary.produced += 1;
        if terminated {
            warn!(event_type = event.event_type(), "dropping event after terminal event");
            continue;
        }
        terminated = event.is_terminal();
        deliver(tx, event, summary);
    }
    terminated
}

fn deliver(tx: &mpsc::UnboundedSender<Event>, event: Event, summary: &mut RunSummary) {
    if tx.send(event).is_ok() {
        summary.delivered += 1;
    } else if !summary.consumer_dropped {
        summary.consumer_dropped = true;
        debug!("consumer disconnected, continuing production");
    }
}

/// Consumer half of a managed run.
pub struct RunEvents {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Stream for RunEvents {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Event stream of one run plus a handle on its producer.
pub struct ManagedRun {
    events: RunEvents,
    handle: JoinHandle<RunSummary>,
}

impl ManagedRun {
    /// Split into the consumer stream and the producer's completion handle.
    /// Dropping the stream never cancels production.
    pub fn into_parts(self) -> (RunEvents, JoinHandle<RunSummary>) {
        (self.events, self.handle)
    }

    /// Wait for production to finish, discarding undelivered events.
    pub fn completion(self) -> JoinHandle<RunSummary> {
        self.handle
    }
}

impl Stream for ManagedRun {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        Pin::new(&mut self.get_mut().events).poll_next(cx)
    }
}
