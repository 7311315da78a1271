//! Webcam access through an `ffmpeg` subprocess.

use crate::config::CameraConfig;
use async_trait::async_trait;
use companion_core::{
    CaptureError,
    capture::{Camera, CameraSelector, StreamConstraints, VideoDevice, VideoStream},
};
use image::DynamicImage;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

const SYSFS_VIDEO_ROOT: &str = "/sys/class/video4linux";
/// Frames decoded and discarded while the sensor adjusts exposure.
const WARM_UP_SECONDS: &str = "0.3";
/// Longest a single ffmpeg run may take before it is killed.
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(15);

pub struct FfmpegCamera {
    config: CameraConfig,
    sysfs_root: PathBuf,
    frame_timeout: Duration,
}

impl FfmpegCamera {
    pub fn new(config: CameraConfig) -> Self {
        Self::with_sysfs_root(config, SYSFS_VIDEO_ROOT)
    }

    pub fn with_sysfs_root(config: CameraConfig, sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            sysfs_root: sysfs_root.into(),
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
        }
    }

    pub fn with_frame_timeout(mut self, frame_timeout: Duration) -> Self {
        self.frame_timeout = frame_timeout;
        self
    }

    fn input_format() -> &'static str {
        if cfg!(target_os = "macos") { "avfoundation" } else { "v4l2" }
    }
}

/// ffmpeg arguments for grabbing one PNG frame to stdout.
pub fn capture_args(input_format: &str, device: &str, width: u32, height: u32) -> Vec<String> {
    let input = if input_format == "avfoundation" {
        format!("{device}:none")
    } else {
        device.to_string()
    };
    let size = format!("{width}x{height}");
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        input_format,
        "-video_size",
        size.as_str(),
        "-i",
        input.as_str(),
        "-ss",
        WARM_UP_SECONDS,
        "-frames:v",
        "1",
        "-f",
        "image2pipe",
        "-c:v",
        "png",
        "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn list_v4l2_devices(root: &Path) -> Result<Vec<VideoDevice>, CaptureError> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(CaptureError::PermissionDenied(e.to_string()));
        }
        Err(e) => return Err(CaptureError::Camera(format!("failed to list cameras: {e}"))),
    };

    let mut devices: Vec<VideoDevice> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let node = entry.file_name().to_string_lossy().to_string();
            let label = std::fs::read_to_string(entry.path().join("name"))
                .map(|name| name.trim().to_string())
                .unwrap_or_default();
            VideoDevice {
                id: format!("/dev/{node}"),
                label,
            }
        })
        .collect();
    devices.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(devices)
}

fn classify_failure(stderr: &str) -> CaptureError {
    let message = stderr.trim().to_string();
    if message.contains("Permission denied") || message.contains("not authorized") {
        CaptureError::PermissionDenied(message)
    } else if message.is_empty() {
        CaptureError::Camera("ffmpeg exited without a frame".to_string())
    } else {
        CaptureError::Camera(message)
    }
}

#[async_trait]
impl Camera for FfmpegCamera {
    async fn enumerate_devices(&self) -> Result<Vec<VideoDevice>, CaptureError> {
        let root = self.sysfs_root.clone();
        tokio::task::spawn_blocking(move || list_v4l2_devices(&root))
            .await
            .map_err(|e| CaptureError::Camera(e.to_string()))?
    }

    async fn open(&self, constraints: &StreamConstraints) -> Result<Box<dyn VideoStream>, CaptureError> {
        let device = match &constraints.selector {
            CameraSelector::Device(id) => id.as_str(),
            CameraSelector::FacingUser => self.config.default_device.as_str(),
        };
        let args = capture_args(Self::input_format(), device, constraints.width, constraints.height);
        debug!(ffmpeg = %self.config.ffmpeg_path.display(), ?args, "Opening camera");

        let child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::PermissionDenied => CaptureError::PermissionDenied(e.to_string()),
                ErrorKind::NotFound => CaptureError::Camera(format!(
                    "ffmpeg not found at {}",
                    self.config.ffmpeg_path.display()
                )),
                _ => CaptureError::Camera(format!("failed to start ffmpeg: {e}")),
            })?;

        Ok(Box::new(FfmpegStream {
            child: Some(child),
            device: device.to_string(),
            timeout: self.frame_timeout,
        }))
    }
}

/// One ffmpeg process producing a single frame.
struct FfmpegStream {
    child: Option<Child>,
    device: String,
    timeout: Duration,
}

#[async_trait]
impl VideoStream for FfmpegStream {
    async fn grab_frame(&mut self) -> Result<DynamicImage, CaptureError> {
        let child = self
            .child
            .take()
            .ok_or_else(|| CaptureError::Camera("camera stream already stopped".to_string()))?;
        // Dropping the timed-out future drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                warn!(device = %self.device, timeout = ?self.timeout, "ffmpeg capture timed out");
                CaptureError::Camera(format!("ffmpeg produced no frame within {:?}", self.timeout))
            })?
            .map_err(|e| CaptureError::Camera(format!("ffmpeg failed: {e}")))?;

        if !output.status.success() || output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(device = %self.device, status = %output.status, "ffmpeg capture failed");
            return Err(classify_failure(&stderr));
        }

        image::load_from_memory_with_format(&output.stdout, image::ImageFormat::Png)
            .map_err(|e| CaptureError::Camera(format!("unreadable frame from ffmpeg: {e}")))
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            debug!(device = %self.device, "Camera released");
        }
    }
}
