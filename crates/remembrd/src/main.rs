use anyhow::{Context, Result};
use remembr_core::{Announcer, GeminiRecognizer, Recognizer, VisitorStore};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod announcer;
mod config;
mod dbus_interface;
mod enroll;
mod monitor;

use announcer::{LogAnnouncer, SpeechAnnouncer};
use dbus_interface::{RemembrService, BUS_NAME, OBJECT_PATH};
use monitor::Monitor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("remembrd starting");

    let config = config::Config::load().context("failed to load configuration")?;
    tracing::debug!(?config, "configuration resolved");

    let store = VisitorStore::load(config.store_path.clone());
    tracing::info!(count = store.len(), path = %config.store_path.display(), "visitor store loaded");
    let (visitors_tx, visitors_rx) = watch::channel(store.snapshot());

    let recognizer: Arc<dyn Recognizer> = Arc::new(
        GeminiRecognizer::new(config.gemini()).context("failed to create recognition client")?,
    );

    let camera = remembr_hw::spawn_capture(&config.camera_device, config.warmup_frames)
        .with_context(|| format!("failed to open camera {}", config.camera_device))?;

    let announcer: Arc<dyn Announcer> = match config
        .speech_command
        .as_deref()
        .and_then(SpeechAnnouncer::from_command_line)
    {
        Some(speech) => {
            tracing::info!(program = speech.program(), "speech output enabled");
            Arc::new(speech)
        }
        None => {
            tracing::info!("no speech command configured; announcements are logged only");
            Arc::new(LogAnnouncer)
        }
    };

    let (monitor, status_rx) = Monitor::new(
        Arc::new(camera),
        recognizer.clone(),
        announcer,
        visitors_rx,
        config.timing(),
    );

    let service = RemembrService::new(
        store,
        visitors_tx,
        status_rx,
        recognizer,
        config.validation_timeout,
    );
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register D-Bus service")?;
    tracing::info!(bus_name = BUS_NAME, "D-Bus service registered");

    let handle = monitor.spawn();
    tracing::info!("remembrd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("remembrd shutting down");
    handle.cancel().await;

    Ok(())
}
