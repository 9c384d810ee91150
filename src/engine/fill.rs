//! 内核缓冲填充控制
//!
//! 每次写入硬件之前决定要睡多久，让内核 ring buffer 中排队的帧数
//! 贴近目标阈值：
//! - 太满：按超出量换算成时间睡眠，直到回落到阈值以下
//! - 目标阈值变化（Short ⇄ Long）：当前阈值每次最多移动 1/4 period
//! - 严重欠载：当前阈值直接降到实际水位之上，避免追一个过时的目标
//!
//! 约定：`query_fill` 报告的 `avail` 是**可写**帧数，
//! 排队帧数 = 容量 − avail。

use crate::audio::pcm::{PcmConfiguration, PcmHandle};
use crate::audio::timing::Clock;

/// 低于这个时长的睡眠不值得做（微秒）
pub const MIN_WRITE_SLEEP_US: u64 = 1_000;

/// S32_LE 每样本字节数
const BYTES_PER_SAMPLE: u64 = 4;

/// 阈值区间
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BufferType {
    /// 刚离开 standby，还没有选定区间
    #[default]
    Unknown,
    /// 低延迟（默认）
    Short,
    /// 深缓冲
    Long,
}

/// 两种区间各自的 period 数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferTuning {
    pub short_period_count: usize,
    pub long_period_count: usize,
}

impl BufferTuning {
    pub fn period_count_for(&self, buffer_type: BufferType) -> usize {
        match buffer_type {
            BufferType::Long => self.long_period_count,
            BufferType::Short | BufferType::Unknown => self.short_period_count,
        }
    }
}

impl Default for BufferTuning {
    fn default() -> Self {
        Self {
            short_period_count: 2,
            long_period_count: 8,
        }
    }
}

/// 选择阈值区间的策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferPolicy {
    /// 熄屏时切换到深缓冲
    pub long_when_screen_off: bool,
}

impl BufferPolicy {
    pub fn select(&self, screen_off: bool) -> BufferType {
        if self.long_when_screen_off && screen_off {
            BufferType::Long
        } else {
            BufferType::Short
        }
    }
}

/// 一次节流的结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThrottleReport {
    /// 累计睡眠（微秒）
    pub slept_us: u64,
    pub sleeps: u32,
    /// 最后一次成功观测到的排队帧数
    pub kernel_frames: Option<usize>,
    /// 因为达到睡眠上限而提前结束
    pub ceiling_hit: bool,
}

/// 填充控制器（每个输出流一个）
#[derive(Clone, Debug)]
pub struct FillController {
    period_size: usize,
    channels: usize,
    rate: u32,
    tuning: BufferTuning,
    max_sleep_us: u64,

    buffer_type: BufferType,
    /// 目标阈值
    write_threshold: usize,
    /// 本次实际使用的阈值，逐步逼近 `write_threshold`
    cur_write_threshold: usize,
}

impl FillController {
    pub fn new(config: &PcmConfiguration, tuning: BufferTuning) -> Self {
        let channels = config.channels as usize;
        let rate = config.rate.max(1);

        // 一个长缓冲的帧数先除以每帧字节数再换算成时间
        let frame_bytes = channels as u64 * BYTES_PER_SAMPLE;
        let max_frames = (config.period_size * tuning.long_period_count) as u64 / frame_bytes;
        let max_sleep_us = max_frames * 1_000_000 / rate as u64;

        Self {
            period_size: config.period_size,
            channels,
            rate,
            tuning,
            max_sleep_us,
            buffer_type: BufferType::Unknown,
            write_threshold: 0,
            cur_write_threshold: 0,
        }
    }

    /// 离开 standby 前调用：下一次选择区间时阈值直接到位
    pub fn reset(&mut self) {
        self.buffer_type = BufferType::Unknown;
    }

    #[inline]
    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    #[inline]
    pub fn write_threshold(&self) -> usize {
        self.write_threshold
    }

    #[inline]
    pub fn cur_write_threshold(&self) -> usize {
        self.cur_write_threshold
    }

    #[inline]
    pub fn max_sleep_us(&self) -> u64 {
        self.max_sleep_us
    }

    /// 超出阈值的帧数对应的睡眠时长
    #[inline]
    pub fn sleep_us_for(&self, excess_frames: usize) -> u64 {
        let frame_bytes = self.channels as u64 * BYTES_PER_SAMPLE;
        excess_frames as u64 * 1_000_000 / frame_bytes / self.rate as u64
    }

    /// 切换阈值区间；从 Unknown 离开时当前阈值直接跳到目标
    pub fn select_buffer_type(&mut self, buffer_type: BufferType) {
        if buffer_type == self.buffer_type || buffer_type == BufferType::Unknown {
            return;
        }

        self.write_threshold = self.period_size * self.tuning.period_count_for(buffer_type);
        if self.buffer_type == BufferType::Unknown {
            self.cur_write_threshold = self.write_threshold;
        }
        log::debug!(
            "Buffer type {:?} -> {:?}, write threshold {} frames",
            self.buffer_type,
            buffer_type,
            self.write_threshold
        );
        self.buffer_type = buffer_type;
    }

    /// 睡到内核排队帧数不超过当前阈值
    ///
    /// 遥测失败、睡眠时长低于下限、累计睡眠超过上限都会结束循环。
    /// 越过上限的那一次睡眠仍然会执行。
    pub fn throttle<H>(&self, pcm: &H, clock: &dyn Clock) -> ThrottleReport
    where
        H: PcmHandle + ?Sized,
    {
        let capacity = pcm.buffer_capacity();
        let mut report = ThrottleReport::default();

        loop {
            let level = match pcm.query_fill() {
                Ok(level) => level,
                Err(_) => break,
            };
            let kernel_frames = level.queued(capacity);
            report.kernel_frames = Some(kernel_frames);

            if kernel_frames <= self.cur_write_threshold {
                break;
            }

            let sleep_us = self.sleep_us_for(kernel_frames - self.cur_write_threshold);
            if sleep_us < MIN_WRITE_SLEEP_US {
                break;
            }

            report.slept_us += sleep_us;
            report.sleeps += 1;
            if report.slept_us > self.max_sleep_us {
                log::trace!(
                    "Limiting write sleep {} us to {} us",
                    report.slept_us,
                    self.max_sleep_us
                );
                report.ceiling_hit = true;
            }
            clock.sleep_us(sleep_us);

            if report.ceiling_hit {
                break;
            }
        }

        report
    }

    /// 当前阈值向目标移动，最多 1/4 period
    ///
    /// 已经在目标上时，如果内核水位比目标低了一个短缓冲以上，
    /// 当前阈值直接降到水位所在 period 的上一个边界再加 1/4 period。
    pub fn ratchet(&mut self, kernel_frames: Option<usize>) {
        let step = self.period_size / 4;

        if self.cur_write_threshold > self.write_threshold {
            self.cur_write_threshold = self
                .cur_write_threshold
                .saturating_sub(step)
                .max(self.write_threshold);
        } else if self.cur_write_threshold < self.write_threshold {
            self.cur_write_threshold = (self.cur_write_threshold + step).min(self.write_threshold);
        } else if let Some(kernel) = kernel_frames {
            let short_frames = self.period_size * self.tuning.short_period_count;
            if kernel < self.write_threshold && self.write_threshold - kernel > short_frames {
                self.cur_write_threshold = (kernel / self.period_size + 1) * self.period_size + step;
                log::debug!(
                    "Kernel buffer depleted ({} frames), threshold reset to {}",
                    kernel,
                    self.cur_write_threshold
                );
            }
        }
    }

    /// 写入前的完整流程
    ///
    /// `bypass` 为真时（SCO 通路）不做任何节流，也不调整阈值。
    pub fn before_write<H>(
        &mut self,
        pcm: &H,
        clock: &dyn Clock,
        buffer_type: BufferType,
        bypass: bool,
    ) -> ThrottleReport
    where
        H: PcmHandle + ?Sized,
    {
        if bypass {
            return ThrottleReport::default();
        }

        self.select_buffer_type(buffer_type);
        let report = self.throttle(pcm, clock);
        self.ratchet(report.kernel_frames);

        if report.sleeps > 0 {
            log::trace!(
                "Throttled {} us in {} sleeps, kernel {:?}, threshold {}/{}",
                report.slept_us,
                report.sleeps,
                report.kernel_frames,
                self.cur_write_threshold,
                self.write_threshold
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::{PcmBackend, PcmFlags};
    use crate::test_support::{ManualClock, MockBackend, MockPcm};

    // period 240 @ 48kHz 立体声，短缓冲 2、长缓冲 8，ring 1920 帧
    fn config() -> PcmConfiguration {
        PcmConfiguration::standard(2, 48_000, 240, 2, 8)
    }

    fn open(backend: &MockBackend) -> MockPcm {
        backend
            .open(0, 0, PcmFlags::OUT, &config())
            .expect("mock open")
    }

    fn controller() -> FillController {
        FillController::new(&config(), BufferTuning::default())
    }

    #[test]
    fn test_sleep_and_ceiling_math() {
        let fc = controller();
        // (240 * 8) / (2 * 4) = 240 帧 → 5000 us
        assert_eq!(fc.max_sleep_us(), 5_000);
        // 480 帧 * 1e6 / 8 / 48000 = 1250 us
        assert_eq!(fc.sleep_us_for(480), 1_250);
        assert_eq!(fc.sleep_us_for(300), 781);
    }

    #[test]
    fn test_cold_start_snaps_to_target() {
        let mut fc = controller();
        assert_eq!(fc.buffer_type(), BufferType::Unknown);

        fc.select_buffer_type(BufferType::Short);
        assert_eq!(fc.write_threshold(), 480);
        assert_eq!(fc.cur_write_threshold(), 480);

        // 之后的区间切换不再直接跳
        fc.select_buffer_type(BufferType::Long);
        assert_eq!(fc.write_threshold(), 1_920);
        assert_eq!(fc.cur_write_threshold(), 480);
    }

    #[test]
    fn test_ramp_bounded_by_quarter_period() {
        let mut fc = controller();
        fc.select_buffer_type(BufferType::Short);
        fc.select_buffer_type(BufferType::Long);

        let mut steps = 0;
        while fc.cur_write_threshold() != fc.write_threshold() {
            let before = fc.cur_write_threshold();
            fc.ratchet(Some(1_900));
            let after = fc.cur_write_threshold();
            assert!(after.abs_diff(before) <= 60, "{} -> {}", before, after);
            assert!(after > before);
            steps += 1;
        }
        // (1920 - 480) / 60
        assert_eq!(steps, 24);

        // 降回短缓冲同样逐步
        fc.select_buffer_type(BufferType::Short);
        let before = fc.cur_write_threshold();
        fc.ratchet(Some(1_900));
        assert_eq!(before - fc.cur_write_threshold(), 60);
    }

    #[test]
    fn test_ramp_clamps_at_target() {
        let config = PcmConfiguration::standard(2, 48_000, 250, 2, 8);
        let mut fc = FillController::new(&config, BufferTuning::default());
        fc.select_buffer_type(BufferType::Long);
        fc.select_buffer_type(BufferType::Short);
        // 2000 → 500，步长 62，最后一步只剩 8
        for _ in 0..30 {
            fc.ratchet(None);
        }
        assert_eq!(fc.cur_write_threshold(), 500);
    }

    #[test]
    fn test_fast_recovery_snap() {
        let mut fc = controller();
        fc.select_buffer_type(BufferType::Long);
        assert_eq!(fc.cur_write_threshold(), 1_920);

        // 水位 100，比目标低 1820 > 480
        fc.ratchet(Some(100));
        assert_eq!(fc.cur_write_threshold(), 240 + 60);

        // 之后恢复为逐步上调
        fc.ratchet(Some(100));
        assert_eq!(fc.cur_write_threshold(), 360);
    }

    #[test]
    fn test_no_snap_without_observation_or_small_gap() {
        let mut fc = controller();
        fc.select_buffer_type(BufferType::Long);

        fc.ratchet(None);
        assert_eq!(fc.cur_write_threshold(), 1_920);

        // 差距正好一个短缓冲：不触发
        fc.ratchet(Some(1_920 - 480));
        assert_eq!(fc.cur_write_threshold(), 1_920);
    }

    #[test]
    fn test_throttle_sleeps_until_below_threshold() {
        let backend = MockBackend::new();
        let pcm = open(&backend);
        let clock = ManualClock::new();
        let mut fc = controller();
        fc.select_buffer_type(BufferType::Short);

        // avail 960 → 排队 960，超出 480 → 1250 us；之后排队 480，不超出
        backend.script_fill(&[Some(960), Some(1_440)]);
        let report = fc.throttle(&pcm, &clock);

        assert_eq!(clock.sleeps(), vec![1_250]);
        assert_eq!(report.slept_us, 1_250);
        assert_eq!(report.kernel_frames, Some(480));
        assert!(!report.ceiling_hit);
    }

    #[test]
    fn test_throttle_skips_short_sleep() {
        let backend = MockBackend::new();
        let pcm = open(&backend);
        let clock = ManualClock::new();
        let mut fc = controller();
        fc.select_buffer_type(BufferType::Short);

        // 超出 300 帧 → 781 us < 1000 us
        backend.set_avail(Some(1_920 - 780));
        let report = fc.throttle(&pcm, &clock);
        assert!(clock.sleeps().is_empty());
        assert_eq!(report.kernel_frames, Some(780));
    }

    #[test]
    fn test_throttle_ceiling() {
        let backend = MockBackend::new();
        let pcm = open(&backend);
        let clock = ManualClock::new();
        let mut fc = controller();
        fc.select_buffer_type(BufferType::Short);

        // 一直满：每次 (1920 - 480) 帧 → 3750 us，第二次越过 5000 us 上限
        backend.set_avail(Some(0));
        let report = fc.throttle(&pcm, &clock);
        assert_eq!(clock.sleeps(), vec![3_750, 3_750]);
        assert!(report.ceiling_hit);
        assert_eq!(report.sleeps, 2);
    }

    #[test]
    fn test_throttle_stops_on_telemetry_failure() {
        let backend = MockBackend::new();
        let pcm = open(&backend);
        let clock = ManualClock::new();
        let mut fc = controller();
        fc.select_buffer_type(BufferType::Short);

        backend.set_avail(None);
        let report = fc.throttle(&pcm, &clock);
        assert_eq!(report, ThrottleReport::default());

        // 第一次成功、第二次失败：保留第一次的观测
        backend.script_fill(&[Some(960), None]);
        let report = fc.throttle(&pcm, &clock);
        assert_eq!(report.kernel_frames, Some(960));
        assert_eq!(report.sleeps, 1);
    }

    #[test]
    fn test_bypass_does_nothing() {
        let backend = MockBackend::new();
        let pcm = open(&backend);
        let clock = ManualClock::new();
        let mut fc = controller();

        backend.set_avail(Some(0));
        let report = fc.before_write(&pcm, &clock, BufferType::Short, true);
        assert_eq!(report, ThrottleReport::default());
        assert_eq!(fc.buffer_type(), BufferType::Unknown);
        assert_eq!(backend.state.lock().fill_queries, 0);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_before_write_full_cycle() {
        let backend = MockBackend::new();
        let pcm = open(&backend);
        let clock = ManualClock::new();
        let mut fc = controller();

        // 冷启动 → Short，阈值 480；排队 100，差距 380 <= 480，不 snap
        backend.set_avail(Some(1_820));
        fc.before_write(&pcm, &clock, BufferType::Short, false);
        assert_eq!(fc.cur_write_threshold(), 480);

        // 熄屏切 Long：逐步上调
        fc.before_write(&pcm, &clock, BufferType::Long, false);
        assert_eq!(fc.write_threshold(), 1_920);
        assert_eq!(fc.cur_write_threshold(), 540);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_buffer_policy() {
        let default = BufferPolicy::default();
        assert_eq!(default.select(true), BufferType::Short);

        let screen_aware = BufferPolicy {
            long_when_screen_off: true,
        };
        assert_eq!(screen_aware.select(true), BufferType::Long);
        assert_eq!(screen_aware.select(false), BufferType::Short);
    }
}
