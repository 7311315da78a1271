//! cpal-backed microphone and speaker.
//!
//! cpal streams are not `Send`, so both streams live on a dedicated bridge
//! thread. Microphone callbacks push downmixed chunks into a channel; the
//! speaker callback drains a ring buffer that the bridge thread refills from
//! the playback channel.

use super::{AudioBackend, AudioPorts};
use crate::audio_utils::{convert_i16_to_f32, downmix};
use async_trait::async_trait;
use companion_core::{ConversationError, Microphone};
use cpal::{
    Device, SampleFormat, Stream, SupportedStreamConfig,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use ringbuf::{
    HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const PLAYBACK_BUFFER_SECONDS: usize = 2;
const STALLED_PUSH_LIMIT: usize = 200;

fn unavailable(message: impl Into<String>) -> ConversationError {
    ConversationError::PermissionDenied(message.into())
}

fn default_input() -> Result<(Device, SupportedStreamConfig), ConversationError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| unavailable("no input device available"))?;
    let config = device
        .default_input_config()
        .map_err(|e| unavailable(e.to_string()))?;
    Ok((device, config))
}

/// Probes the default input device. A missing or unusable device counts as
/// denied access.
pub struct CpalMicrophone;

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn request_access(&self) -> Result<(), ConversationError> {
        let (name, rate) = tokio::task::spawn_blocking(|| {
            let (device, config) = default_input()?;
            Ok::<_, ConversationError>((device.name().unwrap_or_default(), config.sample_rate().0))
        })
        .await
        .map_err(|e| unavailable(e.to_string()))??;
        info!(device = %name, sample_rate = rate, "Microphone available");
        Ok(())
    }
}

pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open(&self) -> Result<AudioPorts, ConversationError> {
        let (capture_tx, capture) = mpsc::unbounded_channel();
        let (playback, playback_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name("audio-bridge".to_string())
            .spawn(move || run_bridge(capture_tx, playback_rx, ready_tx))
            .map_err(|e| ConversationError::SessionStart(format!("failed to spawn audio thread: {e}")))?;

        let (capture_rate, playback_rate) = ready_rx
            .recv()
            .map_err(|_| ConversationError::SessionStart("audio thread exited".to_string()))??;

        Ok(AudioPorts {
            capture,
            capture_rate,
            playback,
            playback_rate,
        })
    }
}

type Ready = std::sync::mpsc::Sender<Result<(u32, u32), ConversationError>>;

struct Bridge {
    input: Stream,
    output: Stream,
    producer: HeapProd<f32>,
    capture_rate: u32,
    playback_rate: u32,
}

fn run_bridge(
    capture_tx: mpsc::UnboundedSender<Vec<f32>>,
    mut playback_rx: mpsc::UnboundedReceiver<Vec<f32>>,
    ready: Ready,
) {
    let bridge = match open_streams(capture_tx) {
        Ok(bridge) => bridge,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let Bridge {
        input,
        output,
        mut producer,
        capture_rate,
        playback_rate,
    } = bridge;
    let _ = ready.send(Ok((capture_rate, playback_rate)));
    info!(capture_rate, playback_rate, "Audio bridge running");

    while let Some(samples) = playback_rx.blocking_recv() {
        let mut offset = 0;
        let mut stalled = 0;
        while offset < samples.len() {
            let pushed = producer.push_slice(&samples[offset..]);
            offset += pushed;
            if offset < samples.len() {
                stalled = if pushed == 0 { stalled + 1 } else { 0 };
                if stalled > STALLED_PUSH_LIMIT {
                    warn!(dropped = samples.len() - offset, "Playback stalled, dropping audio");
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    drop(input);
    drop(output);
    info!("Audio bridge closed");
}

fn open_streams(capture_tx: mpsc::UnboundedSender<Vec<f32>>) -> Result<Bridge, ConversationError> {
    let (input_device, input_config) = default_input()?;
    let host = cpal::default_host();
    let output_device = host
        .default_output_device()
        .ok_or_else(|| ConversationError::SessionStart("no output device available".to_string()))?;
    let output_config = output_device
        .default_output_config()
        .map_err(|e| ConversationError::SessionStart(e.to_string()))?;

    let playback_rate = output_config.sample_rate().0;
    let (producer, consumer) =
        HeapRb::<f32>::new(playback_rate as usize * PLAYBACK_BUFFER_SECONDS).split();

    let input = build_input(&input_device, &input_config, capture_tx)?;
    let output = build_output(&output_device, &output_config, consumer)?;

    input
        .play()
        .map_err(|e| ConversationError::SessionStart(format!("failed to start input stream: {e}")))?;
    output
        .play()
        .map_err(|e| ConversationError::SessionStart(format!("failed to start output stream: {e}")))?;

    Ok(Bridge {
        input,
        output,
        producer,
        capture_rate: input_config.sample_rate().0,
        playback_rate,
    })
}

fn build_input(
    device: &Device,
    config: &SupportedStreamConfig,
    tx: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<Stream, ConversationError> {
    let channels = config.channels() as usize;
    let stream_config = config.config();
    let err_fn = |err| error!("Input stream error: {}", err);

    let stream = match config.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = tx.send(downmix(data, channels));
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let _ = tx.send(downmix(&convert_i16_to_f32(data), channels));
            },
            err_fn,
            None,
        ),
        other => {
            return Err(ConversationError::SessionStart(format!(
                "unsupported input sample format {other:?}"
            )));
        }
    };
    stream.map_err(|e| ConversationError::SessionStart(format!("failed to build input stream: {e}")))
}

fn build_output(
    device: &Device,
    config: &SupportedStreamConfig,
    mut consumer: ringbuf::HeapCons<f32>,
) -> Result<Stream, ConversationError> {
    let channels = config.channels() as usize;
    let stream_config = config.config();
    let err_fn = |err| error!("Output stream error: {}", err);

    let stream = match config.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    frame.fill(consumer.try_pop().unwrap_or(0.0));
                }
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = consumer.try_pop().unwrap_or(0.0).clamp(-1.0, 1.0);
                    frame.fill((sample * i16::MAX as f32) as i16);
                }
            },
            err_fn,
            None,
        ),
        other => {
            return Err(ConversationError::SessionStart(format!(
                "unsupported output sample format {other:?}"
            )));
        }
    };
    stream.map_err(|e| ConversationError::SessionStart(format!("failed to build output stream: {e}")))
}
