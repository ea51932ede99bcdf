use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use relay_core::messages::{ConversationTurn, RunInput};
use relay_core::settings::ModelSettings;

use crate::reflection::{ReflectionResult, ReflectionService};

/// User turns required before reflection is consulted.
pub const MIN_TURNS_FOR_REFLECTION: usize = 3;

/// Per-session mode and model selection, rebuilt from the inbound messages on every run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveState {
    pub think_mode: bool,
    pub current_model: String,
    pub turn_count: usize,
    pub last_reflection: Option<ReflectionResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ConversationTurn>,
}

impl AdaptiveState {
    pub fn initial(fast_model: impl Into<String>) -> Self {
        Self {
            think_mode: false,
            current_model: fast_model.into(),
            turn_count: 0,
            last_reflection: None,
            history: Vec::new(),
        }
    }

    /// The state without its conversation history.
    pub fn summary(&self) -> Self {
        Self {
            history: Vec::new(),
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug)]
pub struct AdaptiveConfig {
    pub main_model: String,
    pub fast_model: String,
    pub enable_adaptive_thinking: bool,
    pub max_turns: usize,
}

impl AdaptiveConfig {
    pub fn from_settings(models: &ModelSettings) -> Self {
        Self {
            main_model: models.main_model.clone(),
            fast_model: models.fast_model.clone(),
            enable_adaptive_thinking: models.enable_adaptive_thinking,
            max_turns: models.reflection_max_turns,
        }
    }

    fn model_for(&self, think_mode: bool) -> &str {
        if think_mode {
            &self.main_model
        } else {
            &self.fast_model
        }
    }
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self::from_settings(&ModelSettings::default())
    }
}

/// Chooses between the fast and the deep-reasoning model for one session.
///
/// Starts in fast mode. Once the conversation holds enough user turns, each
/// run asks the [`ReflectionService`] whether the user is correcting the
/// assistant and switches to the main model when it is.
pub struct AdaptiveController {
    config: AdaptiveConfig,
    reflection: Arc<ReflectionService>,
    state: AdaptiveState,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig, reflection: Arc<ReflectionService>) -> Self {
        let state = AdaptiveState::initial(config.fast_model.clone());
        Self {
            config,
            reflection,
            state,
        }
    }

    /// Resume from a previously saved state.
    pub fn with_state(mut self, state: AdaptiveState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &AdaptiveState {
        &self.state
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// Update the state for an inbound run and return it.
    pub async fn invoke(&mut self, input: &RunInput) -> &AdaptiveState {
        self.state.history = input
            .messages
            .iter()
            .filter(|m| m.role.is_conversational())
            .map(ConversationTurn::from)
            .collect();
        self.state.turn_count = input.user_message_count();
        debug!(
            turn_count = self.state.turn_count,
            history = self.state.history.len(),
            "adaptive invoke"
        );

        let previous = self.state.think_mode;
        let think_mode = if !self.config.enable_adaptive_thinking
            || self.state.turn_count < MIN_TURNS_FOR_REFLECTION
        {
            false
        } else {
            let verdict = self
                .reflection
                .analyze(&self.state.history, self.config.max_turns)
                .await;
            info!(
                needs_thinking = verdict.needs_thinking,
                confidence = verdict.confidence,
                reason = %verdict.reason,
                "reflection verdict"
            );
            let needs_thinking = verdict.needs_thinking;
            self.state.last_reflection = Some(verdict);
            needs_thinking
        };

        self.state.think_mode = think_mode;
        self.state.current_model = self.config.model_for(think_mode).to_string();
        if previous != think_mode {
            info!(
                from = self.config.model_for(previous),
                to = %self.state.current_model,
                "model switched"
            );
        }
        &self.state
    }
}
