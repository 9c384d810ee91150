//! 正弦测试音

use std::f64::consts::TAU;

use super::{DecodeError, PcmSource};
use crate::audio::AudioFormat;

/// -6 dBFS
const AMPLITUDE: f64 = 0.5;

/// 所有声道同相的正弦波，可限定总帧数
pub struct ToneSource {
    format: AudioFormat,
    frequency: f64,
    phase: f64,
    remaining: Option<u64>,
}

impl ToneSource {
    /// `duration_frames` 为 None 时无限长
    pub fn new(format: AudioFormat, frequency: f64, duration_frames: Option<u64>) -> Self {
        Self {
            format,
            frequency,
            phase: 0.0,
            remaining: duration_frames,
        }
    }
}

impl PcmSource for ToneSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_samples(&mut self, output: &mut [i32]) -> Result<usize, DecodeError> {
        let channels = self.format.channels.max(1) as usize;
        let mut frames = output.len() / channels;
        if let Some(remaining) = self.remaining {
            frames = frames.min(remaining as usize);
            self.remaining = Some(remaining - frames as u64);
        }

        let step = TAU * self.frequency / self.format.sample_rate.max(1) as f64;
        for frame in output[..frames * channels].chunks_exact_mut(channels) {
            let value = (self.phase.sin() * AMPLITUDE * i32::MAX as f64) as i32;
            frame.fill(value);
            self.phase = (self.phase + step) % TAU;
        }
        Ok(frames * channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_respects_duration() {
        let mut tone = ToneSource::new(AudioFormat::new(48_000, 2, 32), 1_000.0, Some(100));
        let mut out = vec![0i32; 160];

        assert_eq!(tone.read_samples(&mut out).unwrap(), 160);
        assert_eq!(tone.read_samples(&mut out).unwrap(), 40);
        assert_eq!(tone.read_samples(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_tone_channels_in_phase() {
        let mut tone = ToneSource::new(AudioFormat::new(48_000, 2, 32), 1_000.0, None);
        let mut out = vec![0i32; 96];
        tone.read_samples(&mut out).unwrap();

        assert_eq!(out[0], 0);
        for frame in out.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
            assert!(frame[0].unsigned_abs() <= (i32::MAX / 2) as u32 + 1);
        }
        // 48 帧正好一个周期，12 帧处是波峰
        assert!(out[24] > i32::MAX / 2 - 1_000);
    }

    #[test]
    fn test_read_bytes_packs_stream_format() {
        let mut tone = ToneSource::new(AudioFormat::new(48_000, 2, 16), 1_000.0, Some(10));
        let mut scratch = Vec::new();
        let mut bytes = Vec::new();

        let n = tone.read_bytes(64, &mut scratch, &mut bytes).unwrap();
        assert_eq!(n, 10 * 2 * 2);
        assert_eq!(bytes.len(), n);
    }
}
