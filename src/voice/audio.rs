//! PCM16 conversion between device float samples and the live API wire format.
//!
//! Outbound: mono float samples in `[-1, 1]` at 16kHz → 16-bit LE PCM.
//! Inbound: 16-bit LE PCM at 24kHz mono → float samples ready for playback.

use super::error::{Result, VoiceError};

/// Sample rate of microphone audio sent to the live API.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of synthesized audio received from the live API.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// MIME type declared on every outbound audio chunk.
pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

/// Frames per captured microphone block.
pub const DEFAULT_CAPTURE_BLOCK_FRAMES: usize = 4096;

/// Convert float samples to 16-bit little-endian PCM bytes.
///
/// Each sample is multiplied by 32768 and truncated toward zero. There is no
/// dither; `as` saturates, so `1.0` lands on `i16::MAX`.
pub fn f32_to_pcm16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s * 32768.0) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Convert 16-bit little-endian PCM bytes to float samples in `[-1, 1)`.
pub fn pcm16le_to_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::AudioFormat(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect())
}

/// Average interleaved frames down to mono.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Signed 16-bit device sample to float.
pub fn i16_to_f32(s: i16) -> f32 {
    f32::from(s) / 32768.0
}

/// Unsigned 16-bit device sample (midpoint 32768) to float.
pub fn u16_to_f32(s: u16) -> f32 {
    (f32::from(s) - 32768.0) / 32768.0
}

/// Float to signed 16-bit device sample, saturating at the rails.
pub fn f32_to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * 32768.0) as i16
}

/// Float to unsigned 16-bit device sample, saturating at the rails.
pub fn f32_to_u16(s: f32) -> u16 {
    (s.clamp(-1.0, 1.0) * 32768.0 + 32768.0) as u16
}

/// Streaming linear-interpolation resampler for mono audio.
///
/// Carries the read position and the previous block's last sample across
/// calls, so feeding a signal in arbitrary pieces yields exactly the samples
/// a single call over the whole signal would. The position is kept as an
/// integer count of `1 / to_rate` steps and never accumulates rounding error.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
    pos: u64,
    prev: Option<f32>,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            pos: 0,
            prev: None,
        }
    }

    /// Resample the next piece of the stream.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.from_rate == self.to_rate || self.from_rate == 0 || self.to_rate == 0 {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let from = u64::from(self.from_rate);
        let to = u64::from(self.to_rate);
        // Index 0 is the carried sample when there is one.
        let offset = usize::from(self.prev.is_some());
        let prev = self.prev.unwrap_or(0.0);
        let len = input.len() + offset;
        let at = |i: usize| if i < offset { prev } else { input[i - offset] };

        let mut out = Vec::with_capacity((len as u64 * to / from) as usize + 1);
        loop {
            let idx0 = (self.pos / to) as usize;
            if idx0 + 1 >= len {
                break;
            }
            let frac = (self.pos % to) as f32 / to as f32;
            let (s0, s1) = (at(idx0), at(idx0 + 1));
            out.push(s0 + (s1 - s0) * frac);
            self.pos += from;
        }

        self.pos -= (len as u64 - 1) * to;
        self.prev = input.last().copied();
        out
    }
}

/// Linear-interpolation resampler for one self-contained mono buffer.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let new_len = (samples.len() as f64 * ratio).round() as usize;
    let last = samples.len() - 1;
    (0..new_len)
        .map(|i| {
            let src = i as f64 / ratio;
            let idx0 = (src as usize).min(last);
            let idx1 = (idx0 + 1).min(last);
            let frac = (src - idx0 as f64) as f32;
            samples[idx0] + (samples[idx1] - samples[idx0]) * frac
        })
        .collect()
}

/// A decoded, playable mono buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decode one inbound chunk of 24kHz mono PCM16.
    pub fn from_output_pcm(bytes: &[u8]) -> Result<Self> {
        Ok(Self::new(pcm16le_to_f32(bytes)?, OUTPUT_SAMPLE_RATE))
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
