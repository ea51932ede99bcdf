//! Layered configuration.
//!
//! Sources, lowest to highest priority:
//! 1. Compiled defaults ([`Settings::default()`])
//! 2. User file, `~/.relay/settings.json`, deep-merged over the defaults
//! 3. `RELAY_*` environment variables
//!
//! Environment values that fail to parse are logged and ignored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SettingsError;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub models: ModelSettings,
    pub stream: StreamSettings,
    pub upstream: UpstreamSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelSettings {
    /// Backend used in think mode.
    pub main_model: String,
    /// Backend used in fast mode.
    pub fast_model: String,
    pub reflection_model: String,
    pub enable_adaptive_thinking: bool,
    /// Conversation pairs shown to the reflection model.
    pub reflection_max_turns: usize,
    /// Upper bound on one reflection call; past it the run stays in fast mode.
    pub reflection_timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamSettings {
    pub heartbeat_interval_ms: u64,
    pub check_interval_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpstreamSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub connect_timeout_ms: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Adaptive sessions unused this long are dropped. `None` keeps them for the life of the process.
    pub session_idle_secs: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

/// Adaptive-state archive. Without `database_path` nothing is persisted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreSettings {
    pub database_path: Option<String>,
    /// Directory mirroring the database file between restarts.
    pub remote_dir: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            main_model: "datarobot/azure/gpt-4o".into(),
            fast_model: "datarobot/azure/gpt-4o-mini".into(),
            reflection_model: "datarobot/azure/gpt-4o-mini".into(),
            enable_adaptive_thinking: true,
            reflection_max_turns: 3,
            reflection_timeout_ms: 30_000,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            check_interval_ms: 1_000,
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8842".into(),
            api_key: None,
            connect_timeout_ms: 10_000,
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            session_idle_secs: None,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
        }
    }
}

impl ModelSettings {
    pub fn reflection_timeout(&self) -> Duration {
        Duration::from_millis(self.reflection_timeout_ms)
    }
}

impl StreamSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Never zero, so the heartbeat loop always makes progress.
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

/// `~/.relay/settings.json`, or `./.relay/settings.json` without a home dir.
pub fn settings_path() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".relay").join("settings.json")
}

pub fn load_settings() -> Result<Settings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Missing file means defaults; a present but unreadable or invalid file is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings, SettingsError> {
    let defaults = serde_json::to_value(Settings::default())?;
    let merged = match std::fs::read_to_string(path) {
        Ok(raw) => {
            let user: Value = serde_json::from_str(&raw)?;
            tracing::debug!(?path, "loaded user settings");
            deep_merge(defaults, user)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => defaults,
        Err(source) => {
            return Err(SettingsError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any other
/// overlay value (including arrays) replaces the base value. `null` is skipped.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                if value.is_null() {
                    continue;
                }
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Apply `RELAY_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(settings: &mut Settings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("RELAY_MAIN_MODEL") {
        settings.models.main_model = v;
    }
    if let Some(v) = lookup("RELAY_FAST_MODEL") {
        settings.models.fast_model = v;
    }
    if let Some(v) = lookup("RELAY_REFLECTION_MODEL") {
        settings.models.reflection_model = v;
    }
    if let Some(v) = parsed(&lookup, "RELAY_ADAPTIVE_THINKING", parse_bool) {
        settings.models.enable_adaptive_thinking = v;
    }
    if let Some(v) = parsed(&lookup, "RELAY_HEARTBEAT_INTERVAL_MS", |s| s.parse::<u64>().ok()) {
        settings.stream.heartbeat_interval_ms = v;
    }
    if let Some(v) = parsed(&lookup, "RELAY_CHECK_INTERVAL_MS", |s| s.parse::<u64>().ok()) {
        settings.stream.check_interval_ms = v;
    }
    if let Some(v) = lookup("RELAY_BASE_URL") {
        settings.upstream.base_url = v;
    }
    if let Some(v) = lookup("RELAY_API_KEY") {
        settings.upstream.api_key = Some(v);
    }
    if let Some(v) = lookup("RELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = parsed(&lookup, "RELAY_PORT", |s| s.parse::<u16>().ok()) {
        settings.server.port = v;
    }
    if let Some(v) = parsed(&lookup, "RELAY_SESSION_IDLE_SECS", |s| s.parse::<u64>().ok()) {
        settings.server.session_idle_secs = Some(v);
    }
    if let Some(v) = parsed(&lookup, "RELAY_REFLECTION_TIMEOUT_MS", |s| s.parse::<u64>().ok()) {
        settings.models.reflection_timeout_ms = v;
    }
    if let Some(v) = lookup("RELAY_DATABASE_PATH") {
        settings.store.database_path = Some(v);
    }
    if let Some(v) = lookup("RELAY_REMOTE_DIR") {
        settings.store.remote_dir = Some(v);
    }
}

fn parsed<F, T>(lookup: &F, key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    let value = parse(raw.trim());
    if value.is_none() {
        tracing::warn!(key, value = %raw, "ignoring invalid environment override");
    }
    value
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.models.fast_model, "datarobot/azure/gpt-4o-mini");
        assert!(s.models.enable_adaptive_thinking);
        assert_eq!(s.stream.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(s.stream.check_interval(), Duration::from_secs(1));
        assert_eq!(s.server.port, 8080);
    }

    #[test]
    fn deep_merge_keeps_sibling_keys() {
        let base = json!({"a": {"x": 1, "y": 2}, "b": [1, 2]});
        let overlay = json!({"a": {"y": 3}, "b": [9], "c": null});
        let merged = deep_merge(base, overlay);
        assert_eq!(merged, json!({"a": {"x": 1, "y": 3}, "b": [9]}));
    }

    #[test]
    fn file_overrides_are_deep_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"stream": {"heartbeatIntervalMs": 500}}"#).unwrap();

        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.stream.heartbeat_interval_ms, 500);
        assert_eq!(s.stream.check_interval_ms, 1_000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(s.models, ModelSettings::default());
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn env_overrides_win_and_bad_values_are_ignored() {
        let mut s = Settings::default();
        apply_env_overrides(
            &mut s,
            env(&[
                ("RELAY_MAIN_MODEL", "big"),
                ("RELAY_ADAPTIVE_THINKING", "off"),
                ("RELAY_PORT", "not-a-port"),
                ("RELAY_CHECK_INTERVAL_MS", "250"),
                ("RELAY_DATABASE_PATH", "/var/lib/relay/state.db"),
                ("RELAY_SESSION_IDLE_SECS", "3600"),
                ("RELAY_REFLECTION_TIMEOUT_MS", "soon"),
            ]),
        );
        assert_eq!(s.server.session_idle_secs, Some(3600));
        assert_eq!(s.models.reflection_timeout(), Duration::from_secs(30));
        assert_eq!(s.store.database_path.as_deref(), Some("/var/lib/relay/state.db"));
        assert!(s.store.remote_dir.is_none());
        assert_eq!(s.models.main_model, "big");
        assert!(!s.models.enable_adaptive_thinking);
        assert_eq!(s.server.port, 8080);
        assert_eq!(s.stream.check_interval_ms, 250);
    }

    #[test]
    fn zero_check_interval_is_clamped() {
        let stream = StreamSettings {
            heartbeat_interval_ms: 10,
            check_interval_ms: 0,
        };
        assert_eq!(stream.check_interval(), Duration::from_millis(1));
    }
}
