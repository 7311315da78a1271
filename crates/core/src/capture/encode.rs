//! Frame acquisition and image encoding for one capture.

use super::camera::{Camera, StreamConstraints, select_camera};
use crate::error::CaptureError;
use base64::Engine;
use bytes::Bytes;
use image::{DynamicImage, codecs::jpeg::JpegEncoder};
use serde::Deserialize;
use std::io::Cursor;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    #[default]
    Jpeg,
    Png,
    Webp,
}

impl FrameFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            FrameFormat::Jpeg => "image/jpeg",
            FrameFormat::Png => "image/png",
            FrameFormat::Webp => "image/webp",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            FrameFormat::Jpeg => "jpg",
            FrameFormat::Png => "png",
            FrameFormat::Webp => "webp",
        }
    }
}

impl std::str::FromStr for FrameFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "jpeg" | "jpg" | "image/jpeg" => Ok(FrameFormat::Jpeg),
            "png" | "image/png" => Ok(FrameFormat::Png),
            "webp" | "image/webp" => Ok(FrameFormat::Webp),
            other => Err(format!("'{other}' is not a supported image format")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    pub format: FrameFormat,
    /// Lossy quality in `0.0..=1.0`. Only JPEG uses it; PNG and WebP are
    /// written losslessly.
    pub quality: f32,
    pub width: u32,
    pub height: u32,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            format: FrameFormat::Jpeg,
            quality: 0.9,
            width: 1280,
            height: 720,
        }
    }
}

/// One encoded frame, in both upload forms.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    /// Raw encoded image bytes.
    pub blob: Bytes,
    /// The same image as a `data:` URL.
    pub base64: String,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
}

/// Encodes a frame into the requested format.
pub fn encode_frame(
    frame: &DynamicImage,
    format: FrameFormat,
    quality: f32,
) -> Result<CaptureResult, CaptureError> {
    let rgb = frame.to_rgb8();
    let mut buf = Vec::new();
    match format {
        FrameFormat::Jpeg => {
            let quality = (quality.clamp(0.0, 1.0) * 100.0).round().max(1.0) as u8;
            JpegEncoder::new_with_quality(&mut buf, quality).encode_image(&rgb)?;
        }
        FrameFormat::Png => rgb.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?,
        FrameFormat::Webp => rgb.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::WebP)?,
    }

    let base64 = format!(
        "data:{};base64,{}",
        format.mime_type(),
        base64::engine::general_purpose::STANDARD.encode(&buf)
    );
    Ok(CaptureResult {
        blob: Bytes::from(buf),
        base64,
        width: rgb.width(),
        height: rgb.height(),
        format,
    })
}

/// Opens the preferred camera, grabs one frame and encodes it. The stream is
/// stopped whether or not encoding succeeds.
pub async fn capture_frame(
    camera: &dyn Camera,
    options: &CaptureOptions,
) -> Result<CaptureResult, CaptureError> {
    let constraints = StreamConstraints {
        width: options.width,
        height: options.height,
        selector: select_camera(camera).await,
    };
    let mut stream = camera.open(&constraints).await?;
    let result = match stream.grab_frame().await {
        Ok(frame) => encode_frame(&frame, options.format, options.quality),
        Err(e) => Err(e),
    };
    stream.stop();

    if let Ok(capture) = &result {
        debug!(
            width = capture.width,
            height = capture.height,
            bytes = capture.blob.len(),
            "Captured frame"
        );
    }
    result
}
