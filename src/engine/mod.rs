//! 输出引擎
//!
//! 整合 PCM、重采样、填充控制和路由：
//! - `AudioDevice`: 共享路由状态 + 当前占用硬件的输出流
//! - `OutputStream`: 写路径（声道缩减 → 重采样 → 节流 → 阻塞写入）
//!
//! 锁顺序：设备锁在前，流锁在后，统一通过 `device::lock_pair` 获取。

pub mod device;
pub mod fill;
pub mod params;
pub mod route;
pub mod stream;

pub use device::AudioDevice;
pub use fill::{BufferPolicy, BufferTuning, BufferType, FillController, ThrottleReport};
pub use params::Params;
pub use route::{InputRoute, MixerControl, MixerPaths, Orientation, OutputRoute, SoftMixer};
pub use stream::OutputStream;

use crate::audio::{AudioFormat, PcmConfiguration, PcmError};
use crate::resample::{ResampleError, ResamplerQuality};

/// 设备配置
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// PCM 声卡号
    pub card: u32,
    /// PCM 设备号
    pub device: u32,
    /// 唯一支持的硬件格式
    pub pcm: PcmConfiguration,
    /// 短/长缓冲的 period 数
    pub tuning: BufferTuning,
    pub buffer_policy: BufferPolicy,
    pub resampler: ResamplerQuality,
    /// 调用方没有要求格式时流使用的格式
    pub default_stream_format: AudioFormat,
    pub mixer_paths: MixerPaths,
    /// 启动时的输出路由
    pub initial_route: OutputRoute,
}

impl DeviceConfig {
    /// 由硬件配置推导：短缓冲 = 启动阈值，长缓冲 = ring 深度
    pub fn for_pcm(pcm: PcmConfiguration) -> Self {
        let period = pcm.period_size.max(1);
        let tuning = BufferTuning {
            short_period_count: (pcm.start_threshold / period).max(1),
            long_period_count: pcm.period_count,
        };
        let default_stream_format = AudioFormat::new(pcm.rate, pcm.channels, 32);

        Self {
            card: 0,
            device: 0,
            pcm,
            tuning,
            buffer_policy: BufferPolicy::default(),
            resampler: ResamplerQuality::default(),
            default_stream_format,
            mixer_paths: MixerPaths::default(),
            initial_route: OutputRoute::SPEAKER,
        }
    }

    pub fn validate(&self) -> Result<(), HalError> {
        self.pcm
            .validate()
            .map_err(|e| HalError::InvalidParameter(e.to_string()))?;

        let tuning = &self.tuning;
        if tuning.short_period_count == 0 || tuning.short_period_count > tuning.long_period_count {
            return Err(HalError::InvalidParameter(format!(
                "short period count {} must be in 1..={}",
                tuning.short_period_count, tuning.long_period_count
            )));
        }
        if tuning.long_period_count > self.pcm.period_count {
            return Err(HalError::InvalidParameter(format!(
                "long period count {} exceeds ring depth {}",
                tuning.long_period_count, self.pcm.period_count
            )));
        }
        if !self.accepts_stream_format(&self.default_stream_format) {
            return Err(HalError::InvalidParameter(format!(
                "default stream format {:?} not supported",
                self.default_stream_format
            )));
        }
        Ok(())
    }

    /// 写路径能处理的流格式：支持的位深，声道数不少于硬件
    pub fn accepts_stream_format(&self, format: &AudioFormat) -> bool {
        format.is_supported() && format.channels >= self.pcm.channels
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::for_pcm(PcmConfiguration::default())
    }
}

/// HAL 错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HalError {
    /// PCM 打开或写入失败；下一次写入会重试
    #[error("Hardware unavailable: {0}")]
    HardwareUnavailable(PcmError),

    #[error("Underrun")]
    Underrun,

    #[error("Telemetry unavailable")]
    TelemetryUnavailable,

    #[error("Operation not supported: {0}")]
    UnsupportedOperation(&'static str),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Resampler error: {0}")]
    Resampler(#[from] ResampleError),

    #[error("Unknown mixer path '{0}'")]
    UnknownMixerPath(String),
}

impl From<PcmError> for HalError {
    fn from(e: PcmError) -> Self {
        match e {
            PcmError::Underrun => Self::Underrun,
            PcmError::TelemetryUnavailable => Self::TelemetryUnavailable,
            other => Self::HardwareUnavailable(other),
        }
    }
}
