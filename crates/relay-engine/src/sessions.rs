use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use relay_core::ids::SessionId;

use crate::adaptive::{AdaptiveConfig, AdaptiveController, AdaptiveState};
use crate::reflection::ReflectionService;

pub type SharedController = Arc<Mutex<AdaptiveController>>;

struct Session {
    controller: SharedController,
    last_used: parking_lot::Mutex<Instant>,
}

impl Session {
    fn new(controller: SharedController) -> Self {
        Self {
            controller,
            last_used: parking_lot::Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) -> SharedController {
        *self.last_used.lock() = Instant::now();
        Arc::clone(&self.controller)
    }
}

/// Session id → adaptive controller. Get-or-insert is atomic per key, so two
/// first requests for the same session end up sharing one controller.
///
/// Sessions live until removed, reset, or swept by [`evict_idle`](Self::evict_idle).
pub struct SessionStore {
    sessions: DashMap<SessionId, Session>,
    config: AdaptiveConfig,
    reflection: Arc<ReflectionService>,
}

impl SessionStore {
    pub fn new(config: AdaptiveConfig, reflection: Arc<ReflectionService>) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            reflection,
        }
    }

    fn controller(&self, state: Option<AdaptiveState>) -> SharedController {
        let controller = AdaptiveController::new(self.config.clone(), Arc::clone(&self.reflection));
        let controller = match state {
            Some(state) => controller.with_state(state),
            None => controller,
        };
        Arc::new(Mutex::new(controller))
    }

    pub fn get_or_create(&self, session_id: &SessionId) -> SharedController {
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                debug!(%session_id, "new adaptive session");
                Session::new(self.controller(None))
            })
            .touch()
    }

    /// Seed a session from saved state unless it is already live.
    pub fn restore(&self, session_id: &SessionId, state: AdaptiveState) -> SharedController {
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                debug!(%session_id, "restored adaptive session");
                Session::new(self.controller(Some(state)))
            })
            .touch()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SharedController> {
        self.sessions.get(session_id).map(|entry| Arc::clone(&entry.controller))
    }

    /// Snapshot of a live session's state.
    pub async fn state(&self, session_id: &SessionId) -> Option<AdaptiveState> {
        let controller = self.get(session_id)?;
        let guard = controller.lock().await;
        Some(guard.state().clone())
    }

    /// State a session starts with.
    pub fn initial_state(&self) -> AdaptiveState {
        AdaptiveState::initial(self.config.fast_model.clone())
    }

    pub fn remove(&self, session_id: &SessionId) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Drop sessions unused for longer than `max_idle`. Sessions with a run in
    /// progress are kept. Returns how many were dropped.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            session.last_used.lock().elapsed() <= max_idle || session.controller.try_lock().is_err()
        });
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            info!(evicted, remaining = self.sessions.len(), "evicted idle adaptive sessions");
        }
        evicted
    }

    pub fn reset(&self) {
        self.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_llm::MockProvider;

    fn store() -> Arc<SessionStore> {
        let reflection = Arc::new(ReflectionService::new(Arc::new(MockProvider::new(vec![])), "reflect"));
        Arc::new(SessionStore::new(AdaptiveConfig::default(), reflection))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_share_one_controller() {
        let store = store();
        let id: SessionId = "sess_shared".into();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                let id = id.clone();
                tokio::spawn(async move { store.get_or_create(&id) })
            })
            .collect();

        let mut controllers = Vec::new();
        for handle in handles {
            controllers.push(handle.await.unwrap());
        }
        assert_eq!(store.len(), 1);
        assert!(controllers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn remove_and_reset_forget_sessions() {
        let store = store();
        store.get_or_create(&"a".into());
        store.get_or_create(&"b".into());
        assert_eq!(store.len(), 2);

        assert!(store.remove(&"a".into()));
        assert!(!store.remove(&"a".into()));
        assert!(store.get(&"a".into()).is_none());

        store.reset();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn restore_does_not_clobber_live_sessions() {
        let store = store();
        let id: SessionId = "s".into();

        let mut saved = store.initial_state();
        saved.turn_count = 4;
        store.restore(&id, saved.clone());
        assert_eq!(store.state(&id).await, Some(saved));

        let mut other = store.initial_state();
        other.turn_count = 9;
        store.restore(&id, other);
        assert_eq!(store.state(&id).await.map(|s| s.turn_count), Some(4));
    }

    #[tokio::test]
    async fn unknown_session_has_no_state() {
        assert!(store().state(&"missing".into()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_evicted_and_busy_ones_kept() {
        let store = store();
        let idle: SessionId = "idle".into();
        let busy: SessionId = "busy".into();
        let fresh: SessionId = "fresh".into();
        store.get_or_create(&idle);
        let running = store.get_or_create(&busy);

        tokio::time::sleep(Duration::from_secs(90)).await;
        store.get_or_create(&fresh);
        let _in_run = running.lock().await;

        assert_eq!(store.evict_idle(Duration::from_secs(60)), 1);
        assert!(store.get(&idle).is_none());
        assert!(store.get(&busy).is_some());
        assert!(store.get(&fresh).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reuse_refreshes_idle_clock() {
        let store = store();
        let id: SessionId = "s".into();
        store.get_or_create(&id);
        tokio::time::sleep(Duration::from_secs(50)).await;
        store.get_or_create(&id);
        tokio::time::sleep(Duration::from_secs(50)).await;

        assert_eq!(store.evict_idle(Duration::from_secs(60)), 0);
        assert_eq!(store.len(), 1);
    }
}
