//! 硬件侧播放统计
//!
//! 在 period 时钟（消费者）里收集：period 间隔、队列水位、underrun、
//! 已播放帧数。全部 lock-free，降频采样以减少时钟线程的开销。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 每 N 个 period 采样一次
const SAMPLE_INTERVAL: u64 = 8;

/// 采样环大小
const HISTORY_SIZE: usize = 256;

/// 播放统计收集器
pub struct PlaybackStats {
    period_count: AtomicU64,
    last_sampled_ns: AtomicU64,

    interval_ns: Box<[AtomicU64; HISTORY_SIZE]>,
    interval_idx: AtomicUsize,

    // 采样时刻 ring 中排队的帧数
    water_level: Box<[AtomicUsize; HISTORY_SIZE]>,
    water_idx: AtomicUsize,

    underrun_count: AtomicU64,
    frames_played: AtomicU64,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self {
            period_count: AtomicU64::new(0),
            last_sampled_ns: AtomicU64::new(0),
            interval_ns: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            interval_idx: AtomicUsize::new(0),
            water_level: Box::new(std::array::from_fn(|_| AtomicUsize::new(0))),
            water_idx: AtomicUsize::new(0),
            underrun_count: AtomicU64::new(0),
            frames_played: AtomicU64::new(0),
        }
    }

    /// 每个 period 结束时调用
    ///
    /// `queued_frames`: 取走本 period 之前 ring 中的帧数
    /// `now_ns`: period 边界的单调时间
    #[inline]
    pub fn on_period(&self, queued_frames: usize, now_ns: u64) {
        let count = self.period_count.fetch_add(1, Ordering::Relaxed);
        if count % SAMPLE_INTERVAL != 0 {
            return;
        }

        let last = self.last_sampled_ns.swap(now_ns, Ordering::Relaxed);
        if last > 0 {
            let idx = self.interval_idx.fetch_add(1, Ordering::Relaxed) % HISTORY_SIZE;
            self.interval_ns[idx].store(now_ns.saturating_sub(last), Ordering::Relaxed);
        }

        let idx = self.water_idx.fetch_add(1, Ordering::Relaxed) % HISTORY_SIZE;
        self.water_level[idx].store(queued_frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_frames_played(&self, frames: u64) {
        self.frames_played.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn period_count(&self) -> u64 {
        self.period_count.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, period_size: usize, sample_rate: u32) -> StatsReport {
        let expected_period_ns = if sample_rate == 0 {
            0
        } else {
            period_size as u64 * 1_000_000_000 / sample_rate as u64
        };

        let intervals: Vec<u64> = self
            .interval_ns
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .filter(|&v| v > 0)
            .collect();

        let sampled = (self.water_idx.load(Ordering::Relaxed)).min(HISTORY_SIZE);
        let levels: Vec<usize> = self.water_level[..sampled]
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .collect();

        let interval_stats = match (intervals.iter().min(), intervals.iter().max()) {
            (Some(&min_ns), Some(&max_ns)) => IntervalStats {
                min_ns,
                max_ns,
                avg_ns: intervals.iter().sum::<u64>() / intervals.len() as u64,
            },
            _ => IntervalStats::default(),
        };

        let water_stats = match (levels.iter().min(), levels.iter().max()) {
            (Some(&min), Some(&max)) => WaterLevelStats { min, max },
            _ => WaterLevelStats::default(),
        };

        StatsReport {
            period_count: self.period_count(),
            sample_interval: SAMPLE_INTERVAL,
            expected_sampled_interval_ns: expected_period_ns * SAMPLE_INTERVAL,
            interval_stats,
            water_stats,
            underrun_count: self.underrun_count(),
            frames_played: self.frames_played(),
        }
    }
}

impl Default for PlaybackStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug)]
pub struct StatsReport {
    pub period_count: u64,
    pub sample_interval: u64,
    pub expected_sampled_interval_ns: u64,
    pub interval_stats: IntervalStats,
    pub water_stats: WaterLevelStats,
    pub underrun_count: u64,
    pub frames_played: u64,
}

#[derive(Debug, Default)]
pub struct IntervalStats {
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}

#[derive(Debug, Default)]
pub struct WaterLevelStats {
    pub min: usize,
    pub max: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ms = |ns: u64| ns as f64 / 1_000_000.0;

        writeln!(f, "PCM Statistics")?;
        writeln!(f, "==============")?;
        writeln!(f, "Periods: {}", self.period_count)?;
        writeln!(
            f,
            "Period timing (every {} periods): expected {:.2} ms, min {:.2} ms, max {:.2} ms, avg {:.2} ms",
            self.sample_interval,
            ms(self.expected_sampled_interval_ns),
            ms(self.interval_stats.min_ns),
            ms(self.interval_stats.max_ns),
            ms(self.interval_stats.avg_ns),
        )?;

        let jitter_ns = self
            .interval_stats
            .max_ns
            .saturating_sub(self.interval_stats.min_ns);
        writeln!(f, "Jitter: {:.2} ms", ms(jitter_ns))?;
        writeln!(
            f,
            "Queue level: min {} frames, max {} frames",
            self.water_stats.min, self.water_stats.max
        )?;
        writeln!(f, "Underruns: {}", self.underrun_count)?;
        write!(f, "Frames played: {}", self.frames_played)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = PlaybackStats::new();
        stats.record_underrun();
        stats.record_underrun();
        stats.add_frames_played(256);
        stats.add_frames_played(256);

        assert_eq!(stats.underrun_count(), 2);
        assert_eq!(stats.frames_played(), 512);
    }

    #[test]
    fn test_report_sampling() {
        let stats = PlaybackStats::new();
        let period_ns = 5_000_000;

        // 4 次采样：第 0、8、16、24 个 period
        for i in 0..(SAMPLE_INTERVAL * 3 + 1) {
            let level = if i == SAMPLE_INTERVAL { 100 } else { 400 };
            stats.on_period(level, 1 + i * period_ns);
        }

        let report = stats.report(240, 48_000);
        assert_eq!(report.period_count, SAMPLE_INTERVAL * 3 + 1);
        assert_eq!(report.interval_stats.min_ns, SAMPLE_INTERVAL * period_ns);
        assert_eq!(report.interval_stats.max_ns, SAMPLE_INTERVAL * period_ns);
        assert_eq!(report.water_stats.min, 100);
        assert_eq!(report.water_stats.max, 400);
        // 240 帧 @ 48kHz = 5ms
        assert_eq!(report.expected_sampled_interval_ns, SAMPLE_INTERVAL * 5_000_000);
    }

    #[test]
    fn test_empty_report_display() {
        let report = PlaybackStats::new().report(256, 48_000);
        let text = report.to_string();
        assert!(text.contains("Underruns: 0"));
        assert!(text.contains("Frames played: 0"));
    }
}
