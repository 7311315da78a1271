//! Camera abstraction and front-camera selection.

use crate::error::CaptureError;
use async_trait::async_trait;
use image::DynamicImage;
use tracing::{debug, warn};

/// Label fragments that usually identify a user-facing camera.
const FRONT_CAMERA_PATTERNS: [&str; 4] = ["front", "facetime", "user", "selfie"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDevice {
    pub id: String,
    pub label: String,
}

/// Which camera to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSelector {
    /// A specific device, as returned by [`Camera::enumerate_devices`].
    Device(String),
    /// Whatever the platform considers the user-facing camera.
    FacingUser,
}

/// Requested stream shape. Width and height are hints; the device may pick
/// the closest mode it supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConstraints {
    pub width: u32,
    pub height: u32,
    pub selector: CameraSelector,
}

#[async_trait]
pub trait Camera: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<VideoDevice>, CaptureError>;

    async fn open(&self, constraints: &StreamConstraints) -> Result<Box<dyn VideoStream>, CaptureError>;
}

/// An open camera stream. Holds the device until [`VideoStream::stop`].
#[async_trait]
pub trait VideoStream: Send {
    async fn grab_frame(&mut self) -> Result<DynamicImage, CaptureError>;

    fn stop(&mut self);
}

/// Picks the first device whose label looks like a front-facing camera.
pub fn find_front_camera(devices: &[VideoDevice]) -> Option<&VideoDevice> {
    devices.iter().find(|d| {
        let label = d.label.to_lowercase();
        FRONT_CAMERA_PATTERNS.iter().any(|p| label.contains(p))
    })
}

/// Resolves the selector for a capture: a labelled front camera when one is
/// found, otherwise the generic user-facing request. Enumeration failures
/// fall back silently.
pub async fn select_camera(camera: &dyn Camera) -> CameraSelector {
    match camera.enumerate_devices().await {
        Ok(devices) => match find_front_camera(&devices) {
            Some(device) => {
                debug!(device = %device.id, label = %device.label, "Using front camera");
                CameraSelector::Device(device.id.clone())
            }
            None => CameraSelector::FacingUser,
        },
        Err(e) => {
            warn!(error = %e, "Failed to enumerate cameras");
            CameraSelector::FacingUser
        }
    }
}
