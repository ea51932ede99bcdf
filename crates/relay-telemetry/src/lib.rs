use relay_core::settings::LoggingSettings;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "relay_llm" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines when true, human-readable otherwise.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    pub fn from_settings(settings: &LoggingSettings) -> Self {
        Self {
            log_level: parse_level(&settings.level).unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            json: settings.json,
        }
    }

    pub fn with_module_level(mut self, module: impl Into<String>, level: Level) -> Self {
        self.module_levels.push((module.into(), level));
        self
    }

    /// Directive string handed to `EnvFilter` when RUST_LOG is unset.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Returned by [`init_telemetry`]; records what was installed.
#[derive(Debug)]
pub struct TelemetryGuard {
    installed: bool,
    module_levels: Vec<(String, Level)>,
}

impl TelemetryGuard {
    /// False when another global subscriber was already set.
    pub fn installed(&self) -> bool {
        self.installed
    }

    pub fn module_levels(&self) -> &[(String, Level)] {
        &self.module_levels
    }
}

/// Initialize the global subscriber. Call once at startup; later calls are no-ops.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let installed = tracing_subscriber::registry().with(fmt_layer).try_init().is_ok();
    if !installed {
        eprintln!("relay-telemetry: global subscriber already set");
    }

    TelemetryGuard {
        installed,
        module_levels: config.module_levels,
    }
}

pub fn parse_level(s: &str) -> Option<Level> {
    s.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig::default()
            .with_module_level("relay_llm", Level::DEBUG)
            .with_module_level("hyper", Level::WARN);
        assert_eq!(config.filter_directives(), "info,relay_llm=debug,hyper=warn");
    }

    #[test]
    fn settings_level_falls_back_to_info() {
        let config = TelemetryConfig::from_settings(&LoggingSettings {
            level: "loud".into(),
            json: false,
        });
        assert_eq!(config.log_level, Level::INFO);
        assert!(!config.json);

        let config = TelemetryConfig::from_settings(&LoggingSettings {
            level: "TRACE".into(),
            json: true,
        });
        assert_eq!(config.log_level, Level::TRACE);
    }

    #[test]
    fn second_init_does_not_panic() {
        let _first = init_telemetry(TelemetryConfig::default());
        let second = init_telemetry(TelemetryConfig::default());
        assert!(!second.installed());
    }
}
