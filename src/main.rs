//! # cuelink
//!
//! Command-line client: acquires a session for one table camera, keeps the
//! socket alive and logs health and detections until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};

use cuelink_client::{
    load_settings_from_path, ClientError, ClientEvent, ClientSettings, CueClient,
};
use cuelink_core::StreamId;
use cuelink_store::SqliteStore;
use cuelink_telemetry::{init_telemetry, TelemetryConfig};

/// Billiards stream analytics client.
#[derive(Parser, Debug)]
#[command(name = "cuelink", about = "Billiards stream analytics client")]
struct Cli {
    /// Stream to attach to when no cached session exists.
    #[arg(long, default_value = "camera1")]
    stream: String,

    /// Settings file (defaults to `~/.cuelink/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Backend REST base URL (overrides settings).
    #[arg(long)]
    api_url: Option<String>,

    /// Backend socket base URL (overrides settings).
    #[arg(long)]
    ws_url: Option<String>,

    /// Session cache database (overrides settings).
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// Print available streams and backend config, then exit.
    #[arg(long)]
    list_streams: bool,

    /// Delete the session on the backend when shutting down.
    #[arg(long)]
    logout: bool,
}

impl Cli {
    fn apply(&self, settings: &mut ClientSettings) {
        if let Some(url) = &self.api_url {
            settings.api_base_url.clone_from(url);
        }
        if let Some(url) = &self.ws_url {
            settings.ws_base_url.clone_from(url);
        }
        if let Some(path) = &self.store_path {
            settings.store_path = Some(path.display().to_string());
        }
        if self.json_logs {
            settings.log_json = true;
        }
    }
}

fn ensure_parent_dir(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(cuelink_client::settings::settings_path);
    let mut settings = load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings: {}", settings_path.display()))?;
    cli.apply(&mut settings);

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: Level::from_str(&settings.log_level).unwrap_or(Level::INFO),
        json: settings.log_json,
        ..Default::default()
    });

    let store_path = settings.store_path();
    ensure_parent_dir(&store_path)?;
    let store = SqliteStore::open(&store_path)
        .with_context(|| format!("Failed to open session store: {}", store_path.display()))?;
    info!(path = %store_path.display(), "session store opened");

    let client = CueClient::with_metrics(settings, Arc::new(store), telemetry.metrics())?;

    if cli.list_streams {
        for stream in client.streams().await? {
            info!(
                stream_id = %stream.stream_id,
                name = %stream.name,
                available = stream.available,
                resolution = %stream.resolution,
                "stream"
            );
        }
        let config = client.backend_config().await?;
        info!(version = %config.version, replay = config.flags.replay, "backend config");
        client.destroy();
        return Ok(());
    }

    let _health = client.on_health(|state| {
        info!(
            health = %state.health,
            pipeline = state.pipeline_state.as_str(),
            fps = state.fps_ewma,
            "health"
        );
    });
    let _metadata = client.on_metadata(|update| {
        info!(
            frame_id = update.frame_id,
            detected = update.detected_count,
            tracking = %update.tracking_state,
            "metadata"
        );
    });
    let _events = client.on_event(|event| match event {
        ClientEvent::Superseded { reason } => warn!(%reason, "another client took over this session"),
        ClientEvent::Revoked { reason, message } => warn!(%reason, %message, "session revoked"),
        ClientEvent::StreamChanged { stream_id, play_url } => {
            info!(%stream_id, %play_url, "stream changed");
        }
        ClientEvent::SessionReplaced(session) => {
            info!(session_id = %session.session_id, "session replaced");
        }
    });

    match client.initialize(&StreamId::from(cli.stream.as_str())).await {
        Ok(session) => info!(
            session_id = %session.session_id,
            stream_id = %session.stream_id,
            burnin_url = %session.burnin_url,
            "connected"
        ),
        // The transport keeps retrying in the background after a failed open.
        Err(ClientError::Transport(e)) => warn!(error = %e, "socket not open yet, retrying"),
        Err(e) => {
            client.destroy();
            return Err(e).context("Failed to acquire a session");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    info!(metrics = ?client.metrics(), "shutting down");
    if cli.logout {
        client.logout().await;
    }
    client.destroy();
    Ok(())
}
