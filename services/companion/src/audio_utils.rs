use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Rate of `user_audio_chunk` payloads sent to the agent.
pub const AGENT_INPUT_SAMPLE_RATE: u32 = 16000;
/// Used when the agent announces an output format we cannot parse.
pub const DEFAULT_AGENT_OUTPUT_SAMPLE_RATE: u32 = 16000;
/// Number of bins in the byte spectra handed to visualisers.
pub const FREQUENCY_BIN_COUNT: usize = 64;

// Decibel window mapped onto 0..=255, same as a default Web Audio analyser.
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Mono resampler for arbitrarily sized input. Samples that do not fill a
/// whole chunk are carried over to the next call.
pub struct StreamResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32, chunk_size: usize) -> anyhow::Result<Self> {
        let inner = if in_rate == out_rate {
            None
        } else {
            Some(create_resampler(in_rate as f64, out_rate as f64, chunk_size)?)
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return input.to_vec();
        };

        self.pending.extend_from_slice(input);
        let mut output = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(frames) => output.extend_from_slice(&frames[0]),
                Err(e) => {
                    tracing::error!(error = %e, "Resampling failed, dropping chunk");
                    break;
                }
            }
        }
        output
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Averages interleaved frames down to one channel.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Root-mean-square level, `0.0` for silence or no samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt().clamp(0.0, 1.0)
}

/// Magnitude spectrum of the most recent `2 * bins` samples, each bin mapped
/// from decibels onto `0..=255`.
pub fn byte_frequency_data(samples: &[f32], bins: usize) -> Vec<u8> {
    let window = bins * 2;
    if bins == 0 {
        return Vec::new();
    }
    if samples.len() < window {
        return vec![0; bins];
    }
    let frame = &samples[samples.len() - window..];
    let n = window as f32;

    (0..bins)
        .map(|k| {
            let (mut re, mut im) = (0.0f32, 0.0f32);
            for (t, sample) in frame.iter().enumerate() {
                let angle = -2.0 * std::f32::consts::PI * k as f32 * t as f32 / n;
                re += sample * angle.cos();
                im += sample * angle.sin();
            }
            let magnitude = (re * re + im * im).sqrt() / n;
            if magnitude <= 0.0 {
                return 0;
            }
            let db = 20.0 * magnitude.log10();
            let scaled = (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS) * 255.0;
            scaled.clamp(0.0, 255.0) as u8
        })
        .collect()
}

/// Parses ElevenLabs format names such as `pcm_16000`. Non-PCM formats
/// yield `None`.
pub fn pcm_sample_rate(format: &str) -> Option<u32> {
    format.strip_prefix("pcm_")?.parse().ok()
}

/// Decodes a base64 string representing PCM16 audio into a vector of f32 samples.
/// The function converts the string to a binary vector of u8, interprets chunks as i16 values,
/// and then normalizes them to f32 values between -1.0 and 1.0.
pub fn decode_f32_from_base64_i16(base64_fragment: &str) -> Vec<f32> {
    if let Ok(pcm16_bytes) = base64::engine::general_purpose::STANDARD.decode(base64_fragment) {
        pcm16_bytes
            .chunks_exact(2)
            .map(|chunk| {
                let v = i16::from_le_bytes([chunk[0], chunk[1]]);
                (v as f32 / 32768.0).clamp(-1.0, 1.0)
            })
            .collect()
    } else {
        tracing::error!("Failed to decode base64 fragment to f32");
        Vec::new()
    }
}

/// Encodes a slice of f32 samples into a base64 string (converting to i16 PCM first).
pub fn encode_f32_to_base64_i16(pcm32: &[f32]) -> String {
    let pcm16: Vec<u8> = pcm32
        .iter()
        .flat_map(|&sample| {
            let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            v.to_le_bytes().to_vec()
        })
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&pcm16)
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}
