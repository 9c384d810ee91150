//! 单调时钟与睡眠
//!
//! PCM 以 monotonic 模式打开，硬件时间戳与这里的 `monotonic_now()`
//! 属于同一时间基准（CLOCK_MONOTONIC），可以直接比较。

use std::sync::OnceLock;
use std::time::{Duration, Instant};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// 单调时间戳（秒 + 纳秒）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    secs: u64,
    nanos: u32,
}

impl Timestamp {
    /// 创建时间戳，`nanos` 超过 1 秒的部分会进位到 `secs`
    pub const fn new(secs: u64, nanos: u32) -> Self {
        let carry = nanos as u64 / NANOS_PER_SEC;
        Self {
            secs: secs + carry,
            nanos: (nanos as u64 % NANOS_PER_SEC) as u32,
        }
    }

    pub const fn from_nanos(ns: u64) -> Self {
        Self {
            secs: ns / NANOS_PER_SEC,
            nanos: (ns % NANOS_PER_SEC) as u32,
        }
    }

    #[inline]
    pub fn as_nanos(&self) -> u64 {
        self.secs * NANOS_PER_SEC + self.nanos as u64
    }

    #[inline]
    pub fn secs(&self) -> u64 {
        self.secs
    }

    #[inline]
    pub fn subsec_nanos(&self) -> u32 {
        self.nanos
    }

    /// 从 `earlier` 到 `self` 经过的时间，`earlier` 更晚时返回 0
    pub fn saturating_duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.as_nanos().saturating_sub(earlier.as_nanos()))
    }

    /// 向后推移指定时长
    pub fn add_duration(&self, d: Duration) -> Timestamp {
        Timestamp::from_nanos(self.as_nanos().saturating_add(d.as_nanos() as u64))
    }
}

/// 进程内回退时间基准（只初始化一次）
static FALLBACK_EPOCH: OnceLock<Instant> = OnceLock::new();

fn fallback_now() -> Timestamp {
    let epoch = *FALLBACK_EPOCH.get_or_init(Instant::now);
    Timestamp::from_nanos(epoch.elapsed().as_nanos() as u64)
}

/// 读取 CLOCK_MONOTONIC
#[cfg(unix)]
pub fn monotonic_now() -> Timestamp {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if ret != 0 {
        log::warn!(
            "clock_gettime(CLOCK_MONOTONIC) failed: {}",
            std::io::Error::last_os_error()
        );
        return fallback_now();
    }
    Timestamp::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

#[cfg(not(unix))]
pub fn monotonic_now() -> Timestamp {
    fallback_now()
}

/// 时钟能力：读取当前时间 + 阻塞睡眠
///
/// 写路径上所有睡眠（填充控制器的节流、失败后的节拍睡眠）都经过这里，
/// 测试中替换为只记录不睡眠的实现。
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;

    /// 阻塞当前线程 `us` 微秒
    fn sleep_us(&self, us: u64);
}

/// 系统单调时钟
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Timestamp {
        monotonic_now()
    }

    fn sleep_us(&self, us: u64) {
        if us > 0 {
            std::thread::sleep(Duration::from_micros(us));
        }
    }
}

/// 帧数在给定采样率下对应的微秒数
#[inline]
pub fn frames_to_us(frames: u64, rate: u32) -> u64 {
    if rate == 0 {
        return 0;
    }
    frames * 1_000_000 / rate as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_normalizes_nanos() {
        let ts = Timestamp::new(1, 2_500_000_000);
        assert_eq!(ts.secs(), 3);
        assert_eq!(ts.subsec_nanos(), 500_000_000);
        assert_eq!(ts.as_nanos(), 3_500_000_000);
    }

    #[test]
    fn test_duration_since_saturates() {
        let a = Timestamp::from_nanos(5_000);
        let b = Timestamp::from_nanos(2_000);
        assert_eq!(a.saturating_duration_since(b), Duration::from_nanos(3_000));
        assert_eq!(b.saturating_duration_since(a), Duration::ZERO);
    }

    #[test]
    fn test_monotonic_advances() {
        let t1 = monotonic_now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = monotonic_now();

        assert!(t2 > t1, "time should advance");
        assert!(
            t2.saturating_duration_since(t1) >= Duration::from_millis(8),
            "expected at least 8ms, got {:?}",
            t2.saturating_duration_since(t1)
        );
    }

    #[test]
    fn test_clock_sleep() {
        let clock = MonotonicClock;
        let start = clock.now();
        clock.sleep_us(5_000);
        assert!(clock.now().saturating_duration_since(start) >= Duration::from_micros(4_000));
    }

    #[test]
    fn test_frames_to_us() {
        assert_eq!(frames_to_us(48_000, 48_000), 1_000_000);
        assert_eq!(frames_to_us(480, 48_000), 10_000);
        assert_eq!(frames_to_us(480, 0), 0);
    }
}
