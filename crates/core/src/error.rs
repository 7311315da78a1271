//! Error types shared by the conversation controller and the capture service.

use std::fmt;
use thiserror::Error;

/// The lifecycle operation that blocked a conflicting start/stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Starting,
    Connected,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecyclePhase::Starting => write!(f, "starting"),
            LifecyclePhase::Connected => write!(f, "connected"),
        }
    }
}

/// Failures surfaced by session start/stop and outbound messages.
#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),
    #[error("Failed to start conversation session: {0}")]
    SessionStart(String),
    #[error("Session error: {0}")]
    Session(String),
    #[error("A conversation is already {0}")]
    Busy(LifecyclePhase),
}

/// Failures of a single capture-upload cycle. These never escape the cycle;
/// they are handed to the observer instead.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Camera access denied: {0}")]
    PermissionDenied(String),
    #[error("Camera error: {0}")]
    Camera(String),
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Upload failed with status {status}")]
    Status { status: u16 },
    #[error("Upload request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Invalid upload payload: {0}")]
    Payload(String),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Response body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
