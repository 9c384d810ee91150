//! 重采样模块
//!
//! 把输出流采样率的交错 i32 样本转换到硬件采样率。
//! 两种实现：
//! - `linear`: 定点线性插值，零分配，适合实时写路径
//! - `external`: rubato 多项式插值，质量更高，带内部缓冲

pub mod external;
pub mod linear;

pub use external::RubatoResampler;
pub use linear::LinearResampler;

/// 重采样器特征
pub trait Resampler: Send {
    /// 处理一块交错样本
    ///
    /// input: 输入样本（源采样率，交错格式）
    /// output: 输出缓冲区（目标采样率）
    /// 返回: (消耗的输入帧数, 写入的输出帧数)
    fn resample_from_input(&mut self, input: &[i32], output: &mut [i32]) -> (usize, usize);

    /// 声道数
    fn channels(&self) -> usize;

    /// 输出/输入采样率比
    fn ratio(&self) -> f64;

    /// 延迟（输出帧数）
    fn latency(&self) -> usize;

    /// 丢弃内部状态
    fn reset(&mut self);
}

/// 重采样质量
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResamplerQuality {
    /// 线性插值
    #[default]
    Linear,
    /// rubato 七阶多项式
    Polynomial,
}

impl std::str::FromStr for ResamplerQuality {
    type Err = ResampleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "polynomial" | "rubato" => Ok(Self::Polynomial),
            other => Err(ResampleError::UnknownQuality(other.to_string())),
        }
    }
}

/// 重采样错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResampleError {
    #[error("Unsupported conversion {src} Hz -> {dst} Hz")]
    InvalidRate { src: u32, dst: u32 },

    #[error("Invalid channel count {0}")]
    InvalidChannels(usize),

    #[error("Unknown resampler quality '{0}'")]
    UnknownQuality(String),

    #[error("Resampler backend error: {0}")]
    Backend(String),
}

/// rubato 每次处理的输入块大小（帧）
pub const DEFAULT_CHUNK_FRAMES: usize = 256;

/// 创建重采样器
pub fn create_resampler(
    src_rate: u32,
    dst_rate: u32,
    channels: usize,
    quality: ResamplerQuality,
) -> Result<Box<dyn Resampler>, ResampleError> {
    if src_rate == 0 || dst_rate == 0 {
        return Err(ResampleError::InvalidRate {
            src: src_rate,
            dst: dst_rate,
        });
    }
    if channels == 0 {
        return Err(ResampleError::InvalidChannels(channels));
    }

    log::debug!(
        "Creating {:?} resampler: {} Hz -> {} Hz, {} ch",
        quality,
        src_rate,
        dst_rate,
        channels
    );

    Ok(match quality {
        ResamplerQuality::Linear => Box::new(LinearResampler::new(src_rate, dst_rate, channels)),
        ResamplerQuality::Polynomial => Box::new(RubatoResampler::new(
            src_rate,
            dst_rate,
            channels,
            DEFAULT_CHUNK_FRAMES,
        )?),
    })
}

/// 重采样一块输入所需的输出容量（帧）
#[inline]
pub fn output_capacity(input_frames: usize, src_rate: u32, dst_rate: u32) -> usize {
    if src_rate == 0 {
        return 0;
    }
    (input_frames as u64 * dst_rate as u64 / src_rate as u64) as usize + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_rejects_bad_params() {
        assert!(matches!(
            create_resampler(0, 48_000, 2, ResamplerQuality::Linear),
            Err(ResampleError::InvalidRate { .. })
        ));
        assert!(matches!(
            create_resampler(44_100, 48_000, 0, ResamplerQuality::Linear),
            Err(ResampleError::InvalidChannels(0))
        ));
    }

    #[test]
    fn test_factory_builds_both_kinds() {
        let linear = create_resampler(44_100, 48_000, 2, ResamplerQuality::Linear).unwrap();
        assert_eq!(linear.channels(), 2);
        assert!((linear.ratio() - 48_000.0 / 44_100.0).abs() < 1e-9);

        let poly = create_resampler(44_100, 48_000, 1, ResamplerQuality::Polynomial).unwrap();
        assert_eq!(poly.channels(), 1);
    }

    #[test]
    fn test_quality_parse() {
        assert_eq!("linear".parse::<ResamplerQuality>(), Ok(ResamplerQuality::Linear));
        assert_eq!("Rubato".parse::<ResamplerQuality>(), Ok(ResamplerQuality::Polynomial));
        assert!("sinc".parse::<ResamplerQuality>().is_err());
    }

    #[test]
    fn test_output_capacity() {
        // 一个 period 的 44.1k 输入转换到 48k
        assert_eq!(output_capacity(441, 44_100, 48_000), 481);
        assert_eq!(output_capacity(480, 48_000, 48_000), 481);
    }
}
