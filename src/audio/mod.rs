//! 音频硬件层
//!
//! 包含：
//! - Format: 流格式、样本编解码、声道缩减
//! - Timing: 单调时钟与可替换的 `Clock`
//! - Ring Buffer: Lock-free 帧环形缓冲
//! - Stats: 播放统计
//! - Pcm: PCM 设备抽象与内核缓冲区实现
//! - Virtual / cpal: 两个 PCM 后端

pub mod format;
pub mod pcm;
pub mod ring_buffer;
pub mod stats;
pub mod timing;
pub mod virtual_pcm;

#[cfg(feature = "cpal")]
pub mod cpal_pcm;

pub use format::{keep_leading_channels, AudioFormat};
pub use pcm::{
    FillLevel, PcmBackend, PcmConfiguration, PcmError, PcmFlags, PcmFormat, PcmHandle, PcmQueue,
    PcmState,
};
pub use ring_buffer::FrameRing;
pub use stats::{PlaybackStats, StatsReport};
pub use timing::{monotonic_now, Clock, MonotonicClock, Timestamp};
pub use virtual_pcm::{VirtualPcm, VirtualPcmBackend};

#[cfg(feature = "cpal")]
pub use cpal_pcm::{CpalPcm, CpalPcmBackend};
