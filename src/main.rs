//! # relay
//!
//! Relay server binary: loads settings, wires the upstream provider, the
//! adaptive session store and the optional state archive, then serves HTTP.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use relay_core::settings::{load_settings, load_settings_from_path, Settings};
use relay_engine::{AdaptiveConfig, HeartbeatMerger, ReflectionService, SessionStore, StateArchive};
use relay_llm::{ClientConfig, OpenAiCompatProvider, ReliableConfig, ReliableProvider};
use relay_server::{AppState, ServerConfig};
use relay_store::{LocalDirStore, RemoteStore};
use relay_telemetry::{init_telemetry, TelemetryConfig};

/// Streaming agent relay.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Streaming agent relay server")]
struct Cli {
    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind, overriding settings.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign), overriding settings.
    #[arg(long)]
    port: Option<u16>,

    /// System prompt prepended to runs that carry none.
    #[arg(long)]
    system_prompt: Option<String>,
}

fn open_archive(settings: &Settings) -> Result<Option<Arc<StateArchive>>> {
    let Some(path) = settings.store.database_path.as_deref() else {
        return Ok(None);
    };
    let remote = settings
        .store
        .remote_dir
        .as_deref()
        .map(|dir| Arc::new(LocalDirStore::new(dir)) as Arc<dyn RemoteStore>);
    let archive = StateArchive::open(&PathBuf::from(path), remote)
        .with_context(|| format!("Failed to open state archive at {path}"))?;
    tracing::info!(path, "state archive opened");
    Ok(Some(Arc::new(archive)))
}

/// Periodically drop adaptive sessions idle for longer than `max_idle`.
fn spawn_session_sweeper(sessions: Arc<SessionStore>, max_idle: Duration) {
    let period = (max_idle / 4).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sessions.evict_idle(max_idle);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("Failed to load settings")?;

    let _telemetry = init_telemetry(TelemetryConfig::from_settings(&settings.logging));
    tracing::info!("starting relay");

    let upstream = OpenAiCompatProvider::new(ClientConfig::from_settings(&settings.upstream))
        .context("Failed to build upstream client")?;
    let provider = Arc::new(ReliableProvider::new(
        upstream,
        ReliableConfig::from_settings(&settings.upstream),
    ));

    let reflection = Arc::new(
        ReflectionService::new(provider.clone(), settings.models.reflection_model.clone())
            .with_timeout(settings.models.reflection_timeout()),
    );
    let sessions = Arc::new(SessionStore::new(
        AdaptiveConfig::from_settings(&settings.models),
        reflection,
    ));

    if let Some(idle_secs) = settings.server.session_idle_secs {
        spawn_session_sweeper(Arc::clone(&sessions), Duration::from_secs(idle_secs));
    }

    let mut state = AppState::new(
        sessions,
        provider,
        HeartbeatMerger::from_settings(&settings.stream),
    );
    let archive = open_archive(&settings)?;
    if let Some(archive) = &archive {
        state = state.with_archive(Arc::clone(archive));
    }
    if let Some(prompt) = cli.system_prompt {
        state = state.with_system_prompt(prompt);
    }

    let mut config = ServerConfig::from_settings(&settings.server);
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let handle = relay_server::start(config, state)
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port(), "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;

    if let Some(archive) = archive {
        match Arc::try_unwrap(archive) {
            Ok(archive) => {
                let pushed = archive.close().context("Failed to close state archive")?;
                tracing::info!(pushed, "state archive closed");
            }
            Err(archive) => {
                archive.sync().await.context("Failed to sync state archive")?;
            }
        }
    }
    Ok(())
}
