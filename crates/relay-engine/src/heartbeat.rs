//! Keep-alive merging for slow runs.
//!
//! The main event stream and a heartbeat ticker run as separate tasks that
//! feed one channel. The main producer closes a shared gate before it sends
//! the terminal event, and heartbeats are only sent while holding the gate
//! open, so no heartbeat is ever queued behind the run's terminal event.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use relay_core::events::{Event, EventStream};
use relay_core::ids::{RunId, ThreadId};
use relay_core::settings::StreamSettings;

use crate::error::panic_message;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

enum Merged {
    Event(Event),
    MainDone,
}

/// Interleaves heartbeat signals into a run's events while upstream is idle.
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatMerger {
    heartbeat_interval: Duration,
    check_interval: Duration,
}

impl HeartbeatMerger {
    pub fn new(heartbeat_interval: Duration, check_interval: Duration) -> Self {
        Self {
            heartbeat_interval: heartbeat_interval.max(MIN_INTERVAL),
            check_interval: check_interval.max(MIN_INTERVAL),
        }
    }

    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self::new(settings.heartbeat_interval(), settings.check_interval())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn merge(&self, main: EventStream, thread_id: ThreadId, run_id: RunId) -> EventStream {
        merge(main, thread_id, run_id, self.heartbeat_interval, self.check_interval)
    }
}

impl Default for HeartbeatMerger {
    fn default() -> Self {
        Self::from_settings(&StreamSettings::default())
    }
}

/// Closed once the main stream is over. Sends made under the lock are
/// ordered against the close.
#[derive(Default)]
struct Gate {
    closed: Mutex<bool>,
}

impl Gate {
    fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Close and send `item` as one step.
    fn close_with(&self, tx: &mpsc::UnboundedSender<Merged>, item: Merged) {
        let mut closed = self.closed.lock();
        *closed = true;
        let _ = tx.send(item);
    }

    /// Send only if still open. `None` when closed, else whether the send went through.
    fn send_if_open(&self, tx: &mpsc::UnboundedSender<Merged>, item: Merged) -> Option<bool> {
        let closed = self.closed.lock();
        if *closed {
            return None;
        }
        Some(tx.send(item).is_ok())
    }
}

/// Aborts the heartbeat task when the merged stream goes away.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Merge `main` with heartbeats emitted every `heartbeat_interval` of idleness.
///
/// The heartbeat task sleeps in steps of at most `check_interval` and checks
/// the gate after each one, so it stops within one step of the main stream
/// finishing. Producers are spawned on first poll.
pub fn merge(
    main: EventStream,
    thread_id: ThreadId,
    run_id: RunId,
    heartbeat_interval: Duration,
    check_interval: Duration,
) -> EventStream {
    let heartbeat_interval = heartbeat_interval.max(MIN_INTERVAL);
    let check_interval = check_interval.max(MIN_INTERVAL);

    Box::pin(stream! {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Gate::default());

        let main_task = tokio::spawn(produce_main(main, tx.clone(), Arc::clone(&gate), run_id.clone()));
        let heartbeat_task = tokio::spawn(produce_heartbeats(
            tx,
            gate,
            Event::heartbeat(&thread_id, &run_id),
            heartbeat_interval,
            check_interval,
        ));
        let _abort_heartbeat = AbortOnDrop(heartbeat_task.abort_handle());

        while let Some(item) = rx.recv().await {
            match item {
                Merged::Event(event) => {
                    yield event;
                }
                Merged::MainDone => break,
            }
        }

        heartbeat_task.abort();
        match heartbeat_task.await {
            Err(e) if e.is_panic() => warn!(%run_id, "heartbeat producer panicked"),
            _ => {}
        }
        if let Err(e) = main_task.await {
            warn!(%run_id, error = %e, "main producer did not complete");
        }
    })
}

async fn produce_main(
    mut main: EventStream,
    tx: mpsc::UnboundedSender<Merged>,
    gate: Arc<Gate>,
    run_id: RunId,
) {
    let forwarded = AssertUnwindSafe(async {
        while let Some(event) = main.next().await {
            // A gone consumer does not stop the run.
            if event.is_terminal() {
                gate.close_with(&tx, Merged::Event(event));
            } else {
                let _ = tx.send(Merged::Event(event));
            }
        }
    })
    .catch_unwind()
    .await;

    if let Err(panic) = forwarded {
        error!(%run_id, panic = %panic_message(&panic), "main producer failed");
    }
    gate.close_with(&tx, Merged::MainDone);
}

async fn produce_heartbeats(
    tx: mpsc::UnboundedSender<Merged>,
    gate: Arc<Gate>,
    heartbeat: Event,
    interval: Duration,
    check: Duration,
) {
    loop {
        let mut elapsed = Duration::ZERO;
        while elapsed < interval {
            let step = check.min(interval - elapsed);
            tokio::time::sleep(step).await;
            if gate.is_closed() {
                return;
            }
            elapsed += step;
        }
        match gate.send_if_open(&tx, Merged::Event(heartbeat.clone())) {
            Some(true) => {}
            Some(false) => {
                debug!("merged stream closed, stopping heartbeats");
                return;
            }
            None => return,
        }
    }
}
