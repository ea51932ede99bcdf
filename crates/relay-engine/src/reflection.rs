use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use relay_core::errors::GatewayError;
use relay_core::messages::{ConversationTurn, Message};
use relay_core::provider::{ChatRequest, CompletionModel};

const TEMPERATURE: f64 = 0.1;
const DEFAULT_REASON: &str = "No reason provided";
const DEFAULT_CONFIDENCE: f64 = 0.5;
pub const DEFAULT_REFLECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const NOT_ENOUGH_HISTORY: &str = "Not enough conversation history to analyze";

const PROMPT_HEADER: &str = "\
You are reviewing the latest exchange of a conversation between a user and an assistant.
Decide whether the LAST user message is correcting the assistant right now.

Treat it as a correction when that message:
1. Says the assistant got something wrong or misunderstood (\"No, I meant...\", \"That's not what I asked\")
2. Asks the same question again because the previous answer fell short
3. Shows frustration or confusion about the assistant's last reply
4. Points out an error or something missing from the answer

Conversation (judge only the LAST user message):
";

const PROMPT_FOOTER: &str = r#"
Reply with a single JSON object and nothing else:
{
    "needs_thinking": true or false,
    "reason": "short explanation",
    "confidence": a number between 0.0 and 1.0
}

Rules:
- needs_thinking is true only when the LAST user message is a correction or complaint.
- needs_thinking is false for a new question, thanks or praise, a neutral follow-up,
  or anything suggesting the conversation is going well.
- Earlier corrections do not count. Judge the current exchange only.
"#;

/// Verdict on whether the next turn should use the deep-reasoning model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionResult {
    pub needs_thinking: bool,
    pub reason: String,
    pub confidence: f64,
}

impl ReflectionResult {
    fn fast(reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            needs_thinking: false,
            reason: reason.into(),
            confidence,
        }
    }
}

/// Asks a small model whether the user is correcting the assistant.
///
/// Never fails: an unreachable model or an unreadable reply both resolve to
/// fast mode with zero confidence.
pub struct ReflectionService {
    model: Arc<dyn CompletionModel>,
    model_name: String,
    timeout: Duration,
}

impl ReflectionService {
    pub fn new(model: Arc<dyn CompletionModel>, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
            timeout: DEFAULT_REFLECTION_TIMEOUT,
        }
    }

    /// A call still pending after `timeout` counts as a service error.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Look at the last `max_turns` user/assistant pairs of `history`.
    pub async fn analyze(&self, history: &[ConversationTurn], max_turns: usize) -> ReflectionResult {
        let window = max_turns.saturating_mul(2);
        let recent = &history[history.len().saturating_sub(window)..];
        if recent.len() < 2 {
            return ReflectionResult::fast(NOT_ENOUGH_HISTORY, 1.0);
        }

        let prompt = build_prompt(recent);
        let request = ChatRequest::new(&self.model_name, &[Message::user(prompt)])
            .with_temperature(TEMPERATURE);

        let reply = tokio::time::timeout(self.timeout, self.model.complete(&request))
            .await
            .unwrap_or(Err(GatewayError::Timeout(self.timeout)));
        match reply {
            Ok(reply) => parse_reply(&reply).unwrap_or_else(|e| {
                warn!(error = %e, "failed to parse reflection reply");
                ReflectionResult::fast(format!("Parse error: {e}"), 0.0)
            }),
            Err(e) => {
                warn!(model = %self.model_name, error = %e, "reflection call failed");
                ReflectionResult::fast(format!("Service error: {e}"), 0.0)
            }
        }
    }
}

/// `ROLE: content` lines, oldest first.
pub fn format_history(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(ConversationTurn::transcript_line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_prompt(turns: &[ConversationTurn]) -> String {
    format!("{PROMPT_HEADER}{}\n{PROMPT_FOOTER}", format_history(turns))
}

/// Strip an optional code fence (with or without a `json` tag) around the reply.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let inner = trimmed.split("```").nth(1).unwrap_or_default();
    inner.strip_prefix("json").unwrap_or(inner).trim()
}

/// Parse the model's JSON verdict. Absent or mistyped fields take their defaults.
pub fn parse_reply(raw: &str) -> Result<ReflectionResult, serde_json::Error> {
    let value: Value = serde_json::from_str(strip_fences(raw))?;
    debug!(reply = %value, "reflection reply");
    let field = |name: &str| value.get(name);

    Ok(ReflectionResult {
        needs_thinking: field("needs_thinking").and_then(Value::as_bool).unwrap_or(false),
        reason: field("reason")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_REASON)
            .to_string(),
        confidence: field("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_CONFIDENCE)
            .clamp(0.0, 1.0),
    })
}
