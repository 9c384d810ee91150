//! 音频文件解码
//!
//! 使用 symphonia 解码 FLAC / WAV / AIFF / MP3，输出左对齐的交错 i32，
//! 与 HAL 的 32-bit 流格式一致。

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::{DecodeError, PcmSource};
use crate::audio::AudioFormat;

/// 音频文件信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// 原始位深（如果容器提供）
    pub bit_depth: Option<u32>,
    pub total_frames: Option<u64>,
    pub duration_secs: Option<f64>,
    /// 取自扩展名
    pub format: String,
    pub codec: String,
}

/// 文件解码源
pub struct AudioDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: AudioInfo,
    sample_buf: Option<SampleBuffer<i32>>,
    /// 已解码、尚未被读走的样本
    pending: Vec<i32>,
    pending_pos: usize,
    eof: bool,
}

impl AudioDecoder {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(DecodeError::FileOpen)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|_| DecodeError::UnsupportedFormat)?;
        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;
        let track_id = track.id;
        let params = &track.codec_params;

        let sample_rate = params.sample_rate.ok_or(DecodeError::NoAudioTrack)?;
        let channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);
        let total_frames = params.n_frames;

        let codec = symphonia::default::get_codecs()
            .get_codec(params.codec)
            .map(|c| c.short_name.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let info = AudioInfo {
            sample_rate,
            channels,
            bit_depth: params.bits_per_sample,
            total_frames,
            duration_secs: total_frames.map(|f| f as f64 / sample_rate as f64),
            format: path
                .extension()
                .and_then(|e| e.to_str())
                .map(|s| s.to_uppercase())
                .unwrap_or_else(|| "Unknown".to_string()),
            codec,
        };

        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderCreation(e.to_string()))?;

        log::info!(
            "Opened {}: {} {} Hz, {} ch, {:?} bit",
            path.display(),
            info.codec,
            info.sample_rate,
            info.channels,
            info.bit_depth
        );

        Ok(Self {
            reader,
            decoder,
            track_id,
            info,
            sample_buf: None,
            pending: Vec::new(),
            pending_pos: 0,
            eof: false,
        })
    }

    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    /// 解码下一个 packet 到 `pending`；文件结束返回 false
    fn decode_packet(&mut self) -> Result<bool, DecodeError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(false),
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                // 损坏的帧直接跳过
                Err(SymphoniaError::DecodeError(e)) => {
                    log::debug!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            let spec = *decoded.spec();
            let frames = decoded.capacity();
            // SampleBuffer 的容量按样本计
            let needed = frames * spec.channels.count();
            let reuse = matches!(&self.sample_buf, Some(buf) if buf.capacity() >= needed);
            if !reuse {
                self.sample_buf = Some(SampleBuffer::new(frames as u64, spec));
            }
            let Some(buf) = self.sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            self.pending.clear();
            self.pending.extend_from_slice(buf.samples());
            self.pending_pos = 0;
            return Ok(true);
        }
    }
}

impl PcmSource for AudioDecoder {
    fn format(&self) -> AudioFormat {
        AudioFormat::new(self.info.sample_rate, self.info.channels, 32)
    }

    fn read_samples(&mut self, output: &mut [i32]) -> Result<usize, DecodeError> {
        let mut filled = 0;
        while filled < output.len() {
            if self.pending_pos >= self.pending.len() {
                if self.eof || !self.decode_packet()? {
                    self.eof = true;
                    break;
                }
                continue;
            }
            let n = (output.len() - filled).min(self.pending.len() - self.pending_pos);
            output[filled..filled + n]
                .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
            self.pending_pos += n;
            filled += n;
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 最小的 16-bit 立体声 WAV
    fn write_wav(path: &Path, frames: &[(i16, i16)]) {
        let data_len = (frames.len() * 4) as u32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&44_100u32.to_le_bytes());
        bytes.extend_from_slice(&(44_100u32 * 4).to_le_bytes());
        bytes.extend_from_slice(&4u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for (l, r) in frames {
            bytes.extend_from_slice(&l.to_le_bytes());
            bytes.extend_from_slice(&r.to_le_bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_decode_wav_left_aligned() {
        let path = std::env::temp_dir().join(format!("pcm-out-hal-{}.wav", std::process::id()));
        write_wav(&path, &[(1, -1), (256, -256), (i16::MAX, i16::MIN)]);

        let mut decoder = AudioDecoder::open(&path).unwrap();
        assert_eq!(decoder.format(), AudioFormat::new(44_100, 2, 32));
        assert_eq!(decoder.info().format, "WAV");

        let mut out = [0i32; 16];
        let n = decoder.read_samples(&mut out).unwrap();
        assert_eq!(n, 6);
        assert_eq!(out[0], 1 << 16);
        assert_eq!(out[1], -(1 << 16));
        assert_eq!(out[2], 256 << 16);
        assert_eq!(out[5], (i16::MIN as i32) << 16);

        // 文件结束
        assert_eq!(decoder.read_samples(&mut out).unwrap(), 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AudioDecoder::open("/nonexistent/pcm-out-hal.flac"),
            Err(DecodeError::FileOpen(_))
        ));
    }
}
