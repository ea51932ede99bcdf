//! Run pipeline: translation, heartbeats, decoupled delivery and adaptive model selection.

pub mod adaptive;
pub mod agent;
pub mod archive;
pub mod error;
pub mod heartbeat;
pub mod reflection;
pub mod sessions;
pub mod stream_manager;
pub mod translator;

pub use adaptive::{AdaptiveConfig, AdaptiveController, AdaptiveState};
pub use agent::{AdaptiveAgent, Agent, ProviderAgent, ADAPTIVE_STATE_SIGNAL};
pub use archive::StateArchive;
pub use error::EngineError;
pub use heartbeat::{merge, HeartbeatMerger};
pub use reflection::{ReflectionResult, ReflectionService};
pub use sessions::{SessionStore, SharedController};
pub use stream_manager::{ManagedRun, RunEvents, RunSummary, StreamManager};
pub use translator::{DeltaTranslator, EMPTY_STREAM_MESSAGE};
