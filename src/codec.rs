//! Base64 and 16-bit PCM conversions
//!
//! Shared by the playback scheduler, the microphone pipeline and the live
//! session client. All PCM on the wire is raw little-endian signed 16-bit.

use base64::engine::general_purpose;
use base64::Engine;
use thiserror::Error;

/// Error type for codec operations
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM buffer of {bytes} bytes is not a whole number of frames for {channels} channel(s)")]
    LengthMismatch { bytes: usize, channels: usize },
}

/// Encode a byte buffer as standard base64 text.
pub fn encode(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Decode standard base64 text back into bytes. Exact inverse of [`encode`].
pub fn decode(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(general_purpose::STANDARD.decode(text)?)
}

/// Interpret `bytes` as interleaved little-endian S16 PCM and de-interleave
/// into one normalized f32 buffer per channel.
///
/// Samples map linearly from [-32768, 32767] to about [-1.0, 1.0] by division
/// by 32768. No resampling or channel mixing happens here; the frame count of
/// each output channel is `sample_count / channels`.
pub fn pcm_to_float(bytes: &[u8], channels: usize) -> Result<Vec<Vec<f32>>, CodecError> {
    if channels == 0 || bytes.len() % 2 != 0 {
        return Err(CodecError::LengthMismatch {
            bytes: bytes.len(),
            channels,
        });
    }
    let samples: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    if samples.len() % channels != 0 {
        return Err(CodecError::LengthMismatch {
            bytes: bytes.len(),
            channels,
        });
    }

    let frames = samples.len() / channels;
    let mut out = vec![Vec::with_capacity(frames); channels];
    for (i, sample) in samples.iter().enumerate() {
        out[i % channels].push(*sample as f32 / 32768.0);
    }
    Ok(out)
}

/// Convert normalized f32 samples to little-endian S16 PCM bytes by
/// multiplying by 32768 and truncating. Out-of-range input saturates.
pub fn float_to_pcm(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let value = (sample * 32768.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Playback duration in seconds of `frames` frames at `sample_rate`.
pub fn frames_to_seconds(frames: usize, sample_rate: u32) -> f64 {
    frames as f64 / sample_rate as f64
}
