//! Main Entrypoint for the Companion Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Wiring the webcam, uploader, voice agent and microphone together.
//! 3. Running the selected command until it completes or Ctrl+C arrives.

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use companion_core::{
    CaptureError, CaptureObserver, CaptureService, ConversationController,
    capture::{Camera, CaptureResult, HttpUploader, UploadResponse, find_front_camera},
};
use companion_service::{
    app::Companion,
    audio::default_audio,
    camera::FfmpegCamera,
    config::{CameraConfig, Config, log_level_from_env},
    elevenlabs::ElevenLabsConnector,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(version, about = "Voice companion with periodic webcam context")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy, Default)]
enum Command {
    /// Start the webcam capture and the voice agent (default).
    #[default]
    Run,
    /// Capture and upload a single frame, then exit.
    Capture,
    /// List cameras and mark the one that would be used.
    Devices,
}

/// Waits for the `Ctrl+C` signal.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Initialize Logging ---
    let log_level = log_level_from_env().context("Failed to load configuration")?;
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    // --- 2. Dispatch ---
    match cli.command.unwrap_or_default() {
        Command::Run => run().await,
        Command::Capture => capture_once().await,
        Command::Devices => list_devices().await,
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    info!("Configuration loaded. Wiring services...");

    let camera = Arc::new(FfmpegCamera::new(config.camera.clone()));
    let uploader = Arc::new(HttpUploader::new(config.upload_options()));
    let (microphone, audio) = default_audio();
    let connector = Arc::new(ElevenLabsConnector::new(config.elevenlabs.clone(), audio));
    let controller = Arc::new(ConversationController::new(
        connector,
        microphone,
        config.conversation_settings(),
    ));
    let companion = Companion::new(controller.clone(), camera, uploader, config.capture_settings());

    spawn_state_logger(&companion);

    info!(
        agent_id = %config.agent_id,
        webhook = %config.webhook_url,
        interval_ms = config.capture_interval.as_millis() as u64,
        "Service configured. Starting companion..."
    );
    companion
        .toggle()
        .await
        .context("Failed to start companion")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    if let Err(e) = controller.send_user_message(line.trim()).await {
                        warn!(error = %e, "Failed to send message");
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    stdin_open = false;
                }
            },
        }
    }

    if companion.is_running() {
        companion.toggle().await.context("Failed to stop companion")?;
    }
    info!("Companion has shut down.");
    Ok(())
}

fn spawn_state_logger(companion: &Companion) {
    let mut state = companion.controller().subscribe();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let snapshot = state.borrow_and_update().clone();
            info!(
                status = ?snapshot.status,
                speaking = snapshot.is_speaking,
                sleeping = snapshot.is_sleeping,
                silence_timer = snapshot.silence_timer_armed,
                "Conversation state"
            );
        }
    });

    for mut status in [companion.subscribe(), companion.capture_status()] {
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let line = status.borrow_and_update().clone();
                info!("{}", line);
            }
        });
    }
}

/// Prints the outcome of a one-off capture.
#[derive(Default)]
struct ReportObserver {
    failed: Mutex<bool>,
}

#[async_trait]
impl CaptureObserver for ReportObserver {
    async fn on_success(&self, capture: &CaptureResult, response: UploadResponse) {
        println!(
            "Uploaded {}x{} {} ({} bytes): HTTP {}",
            capture.width,
            capture.height,
            capture.format.mime_type(),
            capture.blob.len(),
            response.status
        );
        println!("{}", String::from_utf8_lossy(&response.body));
    }

    async fn on_error(&self, error: CaptureError) {
        *self.failed.lock() = true;
        eprintln!("Capture failed: {error}");
    }
}

async fn capture_once() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let observer = Arc::new(ReportObserver::default());
    let service = CaptureService::new(
        Arc::new(FfmpegCamera::new(config.camera.clone())),
        Arc::new(HttpUploader::new(config.upload_options())),
        config.capture_settings(),
        observer.clone(),
    );

    service.capture_now().await;
    if *observer.failed.lock() {
        anyhow::bail!("Capture did not complete");
    }
    Ok(())
}

async fn list_devices() -> anyhow::Result<()> {
    let camera = FfmpegCamera::new(CameraConfig::from_env());
    let devices = camera
        .enumerate_devices()
        .await
        .context("Failed to list cameras")?;
    if devices.is_empty() {
        println!("No cameras found.");
        return Ok(());
    }

    let preferred = find_front_camera(&devices).map(|d| d.id.clone());
    for device in &devices {
        let marker = if Some(&device.id) == preferred.as_ref() { "*" } else { " " };
        println!("{marker} {}  {}", device.id, device.label);
    }
    Ok(())
}
