//! PCM 数据源
//!
//! 为演示程序提供写入 HAL 的数据：
//! - `AudioDecoder`: symphonia 文件解码
//! - `ToneSource`: 正弦测试音

pub mod decoder;
pub mod tone;

pub use decoder::{AudioDecoder, AudioInfo};
pub use tone::ToneSource;

use crate::audio::AudioFormat;

/// PCM 数据源错误
///
/// 只有 `AudioDecoder` 会产生；`ToneSource` 从不失败。
/// 演示程序把它当作致命错误，停止播放。
#[derive(Debug)]
pub enum DecodeError {
    /// 源文件打不开
    FileOpen(std::io::Error),
    /// 容器格式无法探测
    UnsupportedFormat,
    /// 文件里没有可播放的音轨，或缺少采样率
    NoAudioTrack,
    /// symphonia 拒绝为该编码创建解码器
    DecoderCreation(String),
    /// `read_samples` 读包或解码时出错
    DecodeFailed(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileOpen(e) => write!(f, "Failed to open PCM source: {}", e),
            Self::UnsupportedFormat => write!(f, "Unsupported container format"),
            Self::NoAudioTrack => write!(f, "No playable audio track"),
            Self::DecoderCreation(s) => write!(f, "Failed to create decoder: {}", s),
            Self::DecodeFailed(s) => write!(f, "PCM source read failed: {}", s),
        }
    }
}

impl std::error::Error for DecodeError {}

/// 交错 i32 样本源（左对齐，格式见 `format`）
pub trait PcmSource: Send {
    fn format(&self) -> AudioFormat;

    /// 填充 `output`，返回写入的样本数；0 表示结束
    fn read_samples(&mut self, output: &mut [i32]) -> Result<usize, DecodeError>;

    /// 读取最多 `frames` 帧并编码为流格式的字节，返回字节数
    fn read_bytes(
        &mut self,
        frames: usize,
        scratch: &mut Vec<i32>,
        output: &mut Vec<u8>,
    ) -> Result<usize, DecodeError> {
        let format = self.format();
        let channels = format.channels as usize;
        scratch.resize(frames * channels, 0);
        let samples = self.read_samples(scratch)?;
        // 只保留完整帧
        let samples = samples - samples % channels.max(1);

        output.resize(samples * format.bytes_per_sample(), 0);
        Ok(format.samples_to_bytes(&scratch[..samples], output))
    }
}
