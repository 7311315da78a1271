//! The companion application: webcam context capture plus the voice agent,
//! switched on and off together.

use companion_core::{
    CaptureService, CaptureSettings, ContextRelay, ConversationController, ConversationError,
    capture::{Camera, ImageUploader},
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

pub const STATUS_STARTED: &str = "App started - webcam and voice agent active";
pub const STATUS_STOPPED: &str = "App stopped";

pub struct Companion {
    controller: Arc<ConversationController>,
    camera: Arc<dyn Camera>,
    uploader: Arc<dyn ImageUploader>,
    capture_settings: CaptureSettings,
    relay: Arc<ContextRelay>,
    capture: Mutex<Option<CaptureService>>,
    status: watch::Sender<String>,
}

impl Companion {
    pub fn new(
        controller: Arc<ConversationController>,
        camera: Arc<dyn Camera>,
        uploader: Arc<dyn ImageUploader>,
        capture_settings: CaptureSettings,
    ) -> Self {
        let relay = Arc::new(ContextRelay::new(controller.clone()));
        let (status, _) = watch::channel(String::new());
        Self {
            controller,
            camera,
            uploader,
            capture_settings,
            relay,
            capture: Mutex::new(None),
            status,
        }
    }

    pub fn controller(&self) -> &Arc<ConversationController> {
        &self.controller
    }

    /// Status lines of the auto-capture cycles.
    pub fn capture_status(&self) -> watch::Receiver<String> {
        self.relay.subscribe()
    }

    /// Status lines of the application as a whole.
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.status.subscribe()
    }

    pub fn status(&self) -> String {
        self.status.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.capture.lock().is_some()
    }

    /// Starts everything when idle, stops everything when running.
    pub async fn toggle(&self) -> Result<(), ConversationError> {
        if self.is_running() {
            self.stop().await
        } else {
            self.start().await
        }
    }

    /// Starts periodic capture, then the conversation. Capture is rolled back
    /// if the conversation cannot start.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), ConversationError> {
        {
            let mut capture = self.capture.lock();
            if capture.is_some() {
                info!("Companion already running");
                return Ok(());
            }
            let service = CaptureService::new(
                self.camera.clone(),
                self.uploader.clone(),
                self.capture_settings.clone(),
                self.relay.clone(),
            );
            service.start();
            *capture = Some(service);
        }

        match self.controller.start_conversation().await {
            Ok(conversation_id) => {
                info!(%conversation_id, "Companion started");
                self.status.send_replace(STATUS_STARTED.to_string());
                Ok(())
            }
            Err(e) => {
                if let Some(service) = self.capture.lock().take() {
                    service.stop();
                }
                error!(error = %e, "Failed to start companion");
                self.status.send_replace(format!("App error: {e}"));
                Err(e)
            }
        }
    }

    /// Ends the conversation and stops capture. While a conversation is still
    /// starting nothing is stopped and the start keeps running.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), ConversationError> {
        let ended = match self.controller.end_conversation().await {
            Err(e @ ConversationError::Busy(_)) => {
                warn!(error = %e, "Cannot stop companion yet");
                self.status.send_replace(format!("App error: {e}"));
                return Err(e);
            }
            other => other,
        };

        if let Some(service) = self.capture.lock().take() {
            service.stop();
        }

        match ended {
            Ok(()) => {
                info!("Companion stopped");
                self.status.send_replace(STATUS_STOPPED.to_string());
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to stop companion cleanly");
                self.status.send_replace(format!("App error: {e}"));
                Err(e)
            }
        }
    }
}
