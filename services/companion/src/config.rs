use companion_core::{
    capture::{CaptureOptions, CaptureSettings, DEFAULT_CAPTURE_INTERVAL, FrameFormat, UploadFormat, UploadOptions},
    controller::{ConversationSettings, DEFAULT_AGENT_ID, DEFAULT_SILENCE_TIMEOUT, DEFAULT_SLEEP_DURATION},
};
use serde_json::{Map, Value};
use std::{path::PathBuf, time::Duration};
use tracing::{Level, warn};

pub const DEFAULT_ELEVENLABS_BASE_URL: &str = "wss://api.elevenlabs.io";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Where and how to grab camera frames.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraConfig {
    pub ffmpeg_path: PathBuf,
    /// Opened when no labelled front camera is found.
    pub default_device: String,
}

/// Remote agent endpoint and credentials.
#[derive(Clone, Debug, PartialEq)]
pub struct ElevenLabsConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub webhook_url: String,
    pub capture_interval: Duration,
    pub upload_format: UploadFormat,
    pub upload_image_field: String,
    pub upload_extra: Map<String, Value>,
    pub capture_format: FrameFormat,
    pub capture_quality: f32,
    pub camera: CameraConfig,
    pub agent_id: String,
    pub elevenlabs: ElevenLabsConfig,
    pub silence_timeout: Duration,
    pub sleep_duration: Duration,
    pub log_level: Level,
}

fn load_dotenv() {
    // Only load from .env in non-test mode to avoid contamination
    if !cfg!(test) {
        dotenvy::dotenv().ok();
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn millis_var(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Reads `RUST_LOG` as a single max level.
pub fn log_level_from_env() -> Result<Level, ConfigError> {
    load_dotenv();
    let log_level_str = var_or("RUST_LOG", "INFO");
    log_level_str.parse::<Level>().map_err(|_| {
        ConfigError::InvalidValue(
            "RUST_LOG".to_string(),
            format!("'{}' is not a valid log level", log_level_str),
        )
    })
}

impl CameraConfig {
    pub fn from_env() -> Self {
        load_dotenv();
        let default_device = if cfg!(target_os = "macos") { "0" } else { "/dev/video0" };
        Self {
            ffmpeg_path: PathBuf::from(var_or("FFMPEG_PATH", "ffmpeg")),
            default_device: var_or("CAMERA_DEVICE", default_device),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();

        let webhook_url = std::env::var("WEBHOOK_URL")
            .map_err(|_| ConfigError::MissingVar("WEBHOOK_URL".to_string()))?;

        // A broken interval falls back to the default rather than failing startup.
        let capture_interval = match millis_var("WEBCAM_INTERVAL_MS", DEFAULT_CAPTURE_INTERVAL) {
            Ok(interval) if !interval.is_zero() => interval,
            Ok(_) | Err(_) => {
                warn!(
                    value = %var_or("WEBCAM_INTERVAL_MS", ""),
                    "Invalid WEBCAM_INTERVAL_MS, using default"
                );
                DEFAULT_CAPTURE_INTERVAL
            }
        };

        let upload_format = var_or("UPLOAD_FORMAT", "formdata")
            .parse::<UploadFormat>()
            .map_err(|e| ConfigError::InvalidValue("UPLOAD_FORMAT".to_string(), e))?;
        let upload_image_field = var_or("UPLOAD_IMAGE_FIELD", "image");

        let upload_extra = match std::env::var("UPLOAD_EXTRA_JSON") {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(ConfigError::InvalidValue(
                        "UPLOAD_EXTRA_JSON".to_string(),
                        "expected a JSON object".to_string(),
                    ));
                }
                Err(e) => {
                    return Err(ConfigError::InvalidValue(
                        "UPLOAD_EXTRA_JSON".to_string(),
                        e.to_string(),
                    ));
                }
            },
            Err(_) => Map::new(),
        };

        let capture_format = var_or("CAPTURE_FORMAT", "jpeg")
            .parse::<FrameFormat>()
            .map_err(|e| ConfigError::InvalidValue("CAPTURE_FORMAT".to_string(), e))?;

        let quality_str = var_or("CAPTURE_QUALITY", "0.9");
        let capture_quality = quality_str
            .trim()
            .parse::<f32>()
            .ok()
            .filter(|q| (0.0..=1.0).contains(q))
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "CAPTURE_QUALITY".to_string(),
                    format!("'{}' is not a number between 0 and 1", quality_str),
                )
            })?;

        let agent_id = var_or("ELEVENLABS_AGENT_ID", DEFAULT_AGENT_ID);
        let elevenlabs = ElevenLabsConfig {
            base_url: var_or("ELEVENLABS_BASE_URL", DEFAULT_ELEVENLABS_BASE_URL),
            api_key: std::env::var("ELEVENLABS_API_KEY").ok().filter(|k| !k.is_empty()),
        };

        let silence_timeout = millis_var("SILENCE_TIMEOUT_MS", DEFAULT_SILENCE_TIMEOUT)?;
        let sleep_duration = millis_var("SLEEP_DURATION_MS", DEFAULT_SLEEP_DURATION)?;

        Ok(Self {
            webhook_url,
            capture_interval,
            upload_format,
            upload_image_field,
            upload_extra,
            capture_format,
            capture_quality,
            camera: CameraConfig::from_env(),
            agent_id,
            elevenlabs,
            silence_timeout,
            sleep_duration,
            log_level: log_level_from_env()?,
        })
    }

    pub fn upload_options(&self) -> UploadOptions {
        UploadOptions {
            url: self.webhook_url.clone(),
            format: self.upload_format,
            image_field: self.upload_image_field.clone(),
            additional_data: self.upload_extra.clone(),
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            interval: self.capture_interval,
            capture: CaptureOptions {
                format: self.capture_format,
                quality: self.capture_quality,
                ..CaptureOptions::default()
            },
        }
    }

    pub fn conversation_settings(&self) -> ConversationSettings {
        ConversationSettings {
            agent_id: self.agent_id.clone(),
            silence_timeout: self.silence_timeout,
            sleep_duration: self.sleep_duration,
            ..ConversationSettings::default()
        }
    }
}
