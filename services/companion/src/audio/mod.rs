//! Local audio I/O for the voice session.
//!
//! With the `audio` feature the microphone and speaker are driven through
//! cpal. Without it the companion runs text-only: user input comes from
//! stdin and agent audio is discarded.

#[cfg(feature = "audio")]
mod device;

#[cfg(feature = "audio")]
pub use device::{CpalBackend, CpalMicrophone};

use async_trait::async_trait;
use companion_core::{ConversationError, Microphone};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Both directions of an open audio device. Dropping the ports releases it.
pub struct AudioPorts {
    /// Mono microphone samples at `capture_rate`.
    pub capture: mpsc::UnboundedReceiver<Vec<f32>>,
    pub capture_rate: u32,
    /// Mono samples to play at `playback_rate`.
    pub playback: mpsc::UnboundedSender<Vec<f32>>,
    pub playback_rate: u32,
}

/// Opens the local audio device for one session.
pub trait AudioBackend: Send + Sync {
    fn open(&self) -> Result<AudioPorts, ConversationError>;
}

/// Reports the microphone as available without touching any device.
pub struct TextOnlyMicrophone;

#[async_trait]
impl Microphone for TextOnlyMicrophone {
    async fn request_access(&self) -> Result<(), ConversationError> {
        warn!("Built without the `audio` feature; the conversation is text-only");
        Ok(())
    }
}

/// The microphone check and audio backend this build supports.
pub fn default_audio() -> (Arc<dyn Microphone>, Option<Arc<dyn AudioBackend>>) {
    #[cfg(feature = "audio")]
    {
        (Arc::new(CpalMicrophone), Some(Arc::new(CpalBackend)))
    }
    #[cfg(not(feature = "audio"))]
    {
        (Arc::new(TextOnlyMicrophone), None)
    }
}
