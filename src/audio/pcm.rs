//! PCM 输出设备抽象
//!
//! 对应内核 PCM ring buffer 的能力集合：
//! - 以 (card, device) 打开，固定硬件格式
//! - 阻塞写入，underrun 单独报告
//! - 水位遥测：可写帧数 + 单调时间戳
//!
//! `PcmQueue` 是内核缓冲区的软件实现（状态机 + 帧环），
//! 供虚拟时钟后端和 cpal 后端共用。

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::ring_buffer::FrameRing;
use super::stats::PlaybackStats;
use super::timing::{frames_to_us, monotonic_now, Timestamp};

/// 硬件样本格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum PcmFormat {
    /// 32-bit 有符号，小端
    S32Le,
}

impl PcmFormat {
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::S32Le => 4,
        }
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S32Le => write!(f, "S32_LE"),
        }
    }
}

/// 硬件 PCM 配置
///
/// 设备创建时确定，之后只读共享给所有输出流。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcmConfiguration {
    pub channels: u16,
    pub rate: u32,
    /// 每个 period 的帧数
    pub period_size: usize,
    /// ring buffer 中的 period 数
    pub period_count: usize,
    pub format: PcmFormat,
    /// 排队达到这么多帧后硬件开始消费
    pub start_threshold: usize,
}

impl PcmConfiguration {
    /// 标准布局：ring 深度为 `long` 个 period，启动阈值为 `short` 个 period
    pub fn standard(channels: u16, rate: u32, period_size: usize, short: usize, long: usize) -> Self {
        Self {
            channels,
            rate,
            period_size,
            period_count: long,
            format: PcmFormat::S32Le,
            start_threshold: period_size * short,
        }
    }

    /// ring buffer 总容量（帧）
    #[inline]
    pub fn buffer_frames(&self) -> usize {
        self.period_size * self.period_count
    }

    /// 每帧字节数
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }

    /// 一个 period 的播放时长
    pub fn period_duration(&self) -> Duration {
        Duration::from_micros(frames_to_us(self.period_size as u64, self.rate))
    }

    pub fn validate(&self) -> Result<(), PcmError> {
        if self.channels == 0 {
            return Err(PcmError::InvalidConfig("channel count is zero".into()));
        }
        if self.rate == 0 {
            return Err(PcmError::InvalidConfig("sample rate is zero".into()));
        }
        if self.period_size == 0 || self.period_count == 0 {
            return Err(PcmError::InvalidConfig(format!(
                "period layout {}x{} is empty",
                self.period_size, self.period_count
            )));
        }
        if self.start_threshold == 0 || self.start_threshold > self.buffer_frames() {
            return Err(PcmError::InvalidConfig(format!(
                "start threshold {} outside 1..={}",
                self.start_threshold,
                self.buffer_frames()
            )));
        }
        Ok(())
    }
}

impl Default for PcmConfiguration {
    fn default() -> Self {
        // 48kHz 立体声，256 帧 period，短缓冲 2 个 period，长缓冲 8 个
        Self::standard(2, 48_000, 256, 2, 8)
    }
}

/// 打开模式标志
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmFlags(u32);

impl PcmFlags {
    pub const OUT: PcmFlags = PcmFlags(1 << 0);
    /// underrun 后不自动重启，由下一次写入重新 prepare
    pub const NORESTART: PcmFlags = PcmFlags(1 << 1);
    /// 时间戳使用 CLOCK_MONOTONIC
    pub const MONOTONIC: PcmFlags = PcmFlags(1 << 2);

    #[inline]
    pub fn contains(&self, other: PcmFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for PcmFlags {
    type Output = PcmFlags;

    fn bitor(self, rhs: PcmFlags) -> PcmFlags {
        PcmFlags(self.0 | rhs.0)
    }
}

/// PCM 层错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PcmError {
    #[error("PCM card {card} device {device} unavailable: {reason}")]
    DeviceUnavailable {
        card: u32,
        device: u32,
        reason: String,
    },

    #[error("PCM underrun")]
    Underrun,

    #[error("PCM timestamp not available")]
    TelemetryUnavailable,

    #[error("Invalid PCM configuration: {0}")]
    InvalidConfig(String),

    #[error("PCM write failed: {0}")]
    WriteFailed(String),
}

/// 水位遥测
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FillLevel {
    /// 可写入（空闲）帧数
    pub avail: usize,
    /// 采样时刻（CLOCK_MONOTONIC）
    pub timestamp: Timestamp,
}

impl FillLevel {
    /// 硬件中排队（尚未播放）的帧数
    ///
    /// 欠载后驱动报告的 avail 可能超过环形缓冲容量，此时取 0 而不是回绕。
    #[inline]
    pub fn queued(&self, capacity: usize) -> usize {
        capacity.saturating_sub(self.avail)
    }
}

/// PCM 后端：按 (card, device) 打开硬件
pub trait PcmBackend: Send + Sync {
    type Handle: PcmHandle;

    fn open(
        &self,
        card: u32,
        device: u32,
        flags: PcmFlags,
        config: &PcmConfiguration,
    ) -> Result<Self::Handle, PcmError>;
}

/// 已打开的 PCM
///
/// 关闭即 drop：所有权保证每个句柄只释放一次。
pub trait PcmHandle: Send {
    /// 阻塞写入全部帧（交错 i32 样本）
    fn write(&mut self, samples: &[i32]) -> Result<(), PcmError>;

    /// 非阻塞水位查询
    fn query_fill(&self) -> Result<FillLevel, PcmError>;

    /// ring buffer 总容量（帧）
    fn buffer_capacity(&self) -> usize;
}

/// 内核 PCM 状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PcmState {
    Prepared = 0,
    Running = 1,
    Xrun = 2,
    Closed = 3,
}

impl PcmState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Prepared,
            1 => Self::Running,
            2 => Self::Xrun,
            _ => Self::Closed,
        }
    }
}

/// 软件实现的内核 PCM 缓冲区
///
/// 生产者：`push`（阻塞，来自输出流的写线程）
/// 消费者：`pull`（每个 period 一次，来自时钟线程或声卡回调）
///
/// 状态机：
/// ```text
/// Prepared --(排队 >= start_threshold)--> Running
/// Running  --(period 到来时数据不足)----> Xrun
/// Xrun     --(下一次 push 报告 Underrun)-> Prepared
/// ```
pub struct PcmQueue {
    ring: FrameRing,
    config: PcmConfiguration,
    state: AtomicU8,
    /// 最近一次硬件指针更新的时间
    last_update: Mutex<Timestamp>,
    stats: Arc<PlaybackStats>,
}

impl PcmQueue {
    pub fn new(config: PcmConfiguration, stats: Arc<PlaybackStats>) -> Self {
        let ring = FrameRing::new(config.buffer_frames(), config.channels as usize);
        // 失败不影响功能，只是可能有换页抖动
        ring.lock_memory();

        Self {
            ring,
            config,
            state: AtomicU8::new(PcmState::Prepared as u8),
            last_update: Mutex::new(monotonic_now()),
            stats,
        }
    }

    #[inline]
    pub fn state(&self) -> PcmState {
        PcmState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: PcmState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// 仅在当前状态为 `from` 时切换
    fn transition(&self, from: PcmState, to: PcmState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn config(&self) -> &PcmConfiguration {
        &self.config
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity_frames()
    }

    #[inline]
    pub fn queued_frames(&self) -> usize {
        self.ring.queued_frames()
    }

    pub fn stats(&self) -> &Arc<PlaybackStats> {
        &self.stats
    }

    /// 阻塞写入全部完整帧
    ///
    /// 缓冲区满时按 1/4 period 轮询等待消费者。
    /// 遇到 xrun（NORESTART 语义）：重新 prepare 并返回 `Underrun`，
    /// 剩余数据被丢弃。
    pub fn push(&self, samples: &[i32]) -> Result<(), PcmError> {
        let channels = self.ring.channels();
        let total_frames = samples.len() / channels;
        let poll = (self.config.period_duration() / 4).max(Duration::from_micros(100));

        let mut done = 0;
        while done < total_frames {
            match self.state() {
                PcmState::Closed => {
                    return Err(PcmError::WriteFailed("PCM is closed".into()));
                }
                PcmState::Xrun => {
                    self.ring.clear();
                    self.transition(PcmState::Xrun, PcmState::Prepared);
                    return Err(PcmError::Underrun);
                }
                PcmState::Prepared | PcmState::Running => {}
            }

            let written = self.ring.write(&samples[done * channels..total_frames * channels]);
            done += written;

            if self.state() == PcmState::Prepared
                && self.ring.queued_frames() >= self.config.start_threshold
            {
                *self.last_update.lock() = monotonic_now();
                if self.transition(PcmState::Prepared, PcmState::Running) {
                    log::debug!(
                        "PCM started with {} frames queued",
                        self.ring.queued_frames()
                    );
                }
            }

            if done < total_frames && written == 0 {
                std::thread::sleep(poll);
            }
        }

        Ok(())
    }

    /// 消费一个 period（或回调请求的帧数）
    ///
    /// 未运行时输出静音；数据不足时补静音并进入 Xrun。
    /// 返回实际取出的帧数。
    pub fn pull(&self, output: &mut [i32], now: Timestamp) -> usize {
        if self.state() != PcmState::Running {
            output.fill(0);
            return 0;
        }

        let channels = self.ring.channels();
        let wanted = output.len() / channels;
        self.stats.on_period(self.ring.queued_frames(), now.as_nanos());

        let got = self.ring.read(output);
        if got < wanted {
            output[got * channels..].fill(0);
            if self.transition(PcmState::Running, PcmState::Xrun) {
                self.ring.clear();
                self.stats.record_underrun();
                log::debug!("PCM xrun: {} of {} frames available", got, wanted);
            }
        }

        self.stats.add_frames_played(got as u64);
        *self.last_update.lock() = now;
        got
    }

    /// 水位查询：只有 Running 状态下才有有效的硬件时间戳
    pub fn fill_level(&self) -> Result<FillLevel, PcmError> {
        if self.state() != PcmState::Running {
            return Err(PcmError::TelemetryUnavailable);
        }
        Ok(FillLevel {
            avail: self.ring.free_frames(),
            timestamp: *self.last_update.lock(),
        })
    }

    pub fn close(&self) {
        self.set_state(PcmState::Closed);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state() == PcmState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> PcmConfiguration {
        // 4 帧 period，启动阈值 2 个 period，ring 4 个 period
        PcmConfiguration::standard(2, 48_000, 4, 2, 4)
    }

    #[test]
    fn test_standard_layout() {
        let config = PcmConfiguration::standard(2, 48_000, 240, 2, 8);
        assert_eq!(config.period_count, 8);
        assert_eq!(config.start_threshold, 480);
        assert_eq!(config.buffer_frames(), 1920);
        assert_eq!(config.frame_bytes(), 8);
        assert_eq!(config.period_duration(), Duration::from_millis(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_layout() {
        let mut config = PcmConfiguration::default();
        config.channels = 0;
        assert!(matches!(config.validate(), Err(PcmError::InvalidConfig(_))));

        let mut config = PcmConfiguration::default();
        config.start_threshold = config.buffer_frames() + 1;
        assert!(matches!(config.validate(), Err(PcmError::InvalidConfig(_))));
    }

    #[test]
    fn test_flags() {
        let flags = PcmFlags::OUT | PcmFlags::NORESTART | PcmFlags::MONOTONIC;
        assert!(flags.contains(PcmFlags::NORESTART));
        assert!(!PcmFlags::OUT.contains(PcmFlags::MONOTONIC));
    }

    #[test]
    fn test_fill_level_queued() {
        let level = FillLevel {
            avail: 100,
            timestamp: Timestamp::default(),
        };
        assert_eq!(level.queued(480), 380);
        assert_eq!(level.queued(50), 0);
    }

    #[test]
    fn test_queue_starts_at_threshold() {
        let queue = PcmQueue::new(small_config(), Arc::new(PlaybackStats::new()));
        assert_eq!(queue.state(), PcmState::Prepared);
        assert_eq!(queue.fill_level(), Err(PcmError::TelemetryUnavailable));

        // 4 帧 < 启动阈值 8
        queue.push(&[1; 8]).unwrap();
        assert_eq!(queue.state(), PcmState::Prepared);

        queue.push(&[1; 8]).unwrap();
        assert_eq!(queue.state(), PcmState::Running);

        let level = queue.fill_level().unwrap();
        assert_eq!(level.avail, 16 - 8);
        assert_eq!(level.queued(queue.capacity()), 8);
    }

    #[test]
    fn test_queue_xrun_reports_underrun_once() {
        let stats = Arc::new(PlaybackStats::new());
        let queue = PcmQueue::new(small_config(), Arc::clone(&stats));
        queue.push(&[7; 16]).unwrap();

        let mut period = [0i32; 8];
        let now = monotonic_now();
        assert_eq!(queue.pull(&mut period, now), 4);
        assert_eq!(period, [7; 8]);
        assert_eq!(queue.pull(&mut period, now), 4);
        // 空了：补静音并进入 xrun
        assert_eq!(queue.pull(&mut period, now), 0);
        assert_eq!(period, [0; 8]);
        assert_eq!(queue.state(), PcmState::Xrun);
        assert_eq!(stats.underrun_count(), 1);
        assert_eq!(stats.frames_played(), 8);

        assert_eq!(queue.push(&[1; 8]), Err(PcmError::Underrun));
        assert_eq!(queue.state(), PcmState::Prepared);
        assert_eq!(queue.queued_frames(), 0);

        // 重新 prepare 后正常写入
        assert!(queue.push(&[1; 8]).is_ok());
    }

    #[test]
    fn test_pull_before_start_is_silent() {
        let queue = PcmQueue::new(small_config(), Arc::new(PlaybackStats::new()));
        queue.push(&[5; 4]).unwrap();
        let mut period = [9i32; 8];
        assert_eq!(queue.pull(&mut period, monotonic_now()), 0);
        assert_eq!(period, [0; 8]);
        assert_eq!(queue.queued_frames(), 2);
    }

    #[test]
    fn test_push_after_close_fails() {
        let queue = PcmQueue::new(small_config(), Arc::new(PlaybackStats::new()));
        queue.close();
        assert!(matches!(queue.push(&[0; 2]), Err(PcmError::WriteFailed(_))));
    }
}
