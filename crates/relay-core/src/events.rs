use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{MessageId, RunId, ThreadId, ToolCallId};

/// Name of the keep-alive signal injected while a run is idle.
pub const HEARTBEAT_SIGNAL: &str = "Heartbeat";

/// Boxed, owned event sequence for one run.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Externally observable output of one agent run. Ordering contract:
///
/// RunStarted → (TextMessageStart → TextMessageDelta* → TextMessageEnd | ToolCallDelta |
///               CustomSignal)* → (RunFinished | RunError)
///
/// The wire form is internally tagged on `type` with camelCase fields, which is
/// also the shape accepted when an upstream chunk embeds a pre-built event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Event {
    RunStarted {
        thread_id: ThreadId,
        run_id: RunId,
    },

    TextMessageStart {
        message_id: MessageId,
    },

    #[serde(rename = "TEXT_MESSAGE_CONTENT")]
    TextMessageDelta {
        message_id: MessageId,
        #[serde(rename = "delta")]
        text: String,
    },

    TextMessageEnd {
        message_id: MessageId,
    },

    #[serde(rename = "TOOL_CALL_CHUNK")]
    ToolCallDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<ToolCallId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<MessageId>,
        #[serde(rename = "toolCallName", default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(rename = "delta", default, skip_serializing_if = "Option::is_none")]
        args_delta: Option<String>,
    },

    #[serde(rename = "CUSTOM")]
    CustomSignal {
        name: String,
        #[serde(rename = "value", default)]
        payload: Value,
    },

    RunFinished {
        thread_id: ThreadId,
        run_id: RunId,
    },

    RunError {
        message: String,
    },
}

impl Event {
    pub fn heartbeat(thread_id: &ThreadId, run_id: &RunId) -> Self {
        Self::CustomSignal {
            name: HEARTBEAT_SIGNAL.to_string(),
            payload: serde_json::json!({
                "thread_id": thread_id.as_str(),
                "run_id": run_id.as_str(),
            }),
        }
    }

    pub fn run_error(message: impl Into<String>) -> Self {
        Self::RunError {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished { .. } | Self::RunError { .. })
    }

    /// High-frequency events that are not worth logging one by one.
    pub fn is_content_delta(&self) -> bool {
        matches!(self, Self::TextMessageDelta { .. })
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::CustomSignal { name, .. } if name == HEARTBEAT_SIGNAL)
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "RUN_STARTED",
            Self::TextMessageStart { .. } => "TEXT_MESSAGE_START",
            Self::TextMessageDelta { .. } => "TEXT_MESSAGE_CONTENT",
            Self::TextMessageEnd { .. } => "TEXT_MESSAGE_END",
            Self::ToolCallDelta { .. } => "TOOL_CALL_CHUNK",
            Self::CustomSignal { .. } => "CUSTOM",
            Self::RunFinished { .. } => "RUN_FINISHED",
            Self::RunError { .. } => "RUN_ERROR",
        }
    }
}
