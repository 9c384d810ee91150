//! 虚拟 PCM 后端
//!
//! 由一个时钟线程按 period 节拍消费 `PcmQueue`，
//! 行为上等价于一块没有 DMA 延迟的声卡：写入阻塞、水位遥测、
//! underrun 都和真实硬件一致，但样本被丢弃。
//!
//! 用于无声卡环境（CI、容器）和 demo。

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::pcm::{
    FillLevel, PcmBackend, PcmConfiguration, PcmError, PcmFlags, PcmHandle, PcmQueue,
};
use super::stats::PlaybackStats;
use super::timing::monotonic_now;

/// 落后超过这么多个 period 就放弃追赶，重新对齐节拍
const MAX_CATCH_UP_PERIODS: u32 = 4;

struct BackendShared {
    /// 已被占用的 (card, device)
    claimed: Mutex<HashSet<(u32, u32)>>,
    /// 标记为不可用的 (card, device)
    unavailable: Mutex<HashSet<(u32, u32)>>,
    stats: Arc<PlaybackStats>,
}

/// 虚拟声卡
#[derive(Clone)]
pub struct VirtualPcmBackend {
    shared: Arc<BackendShared>,
}

impl VirtualPcmBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(BackendShared {
                claimed: Mutex::new(HashSet::new()),
                unavailable: Mutex::new(HashSet::new()),
                stats: Arc::new(PlaybackStats::new()),
            }),
        }
    }

    /// 所有句柄共用的播放统计（跨 standby 累积）
    pub fn stats(&self) -> Arc<PlaybackStats> {
        Arc::clone(&self.shared.stats)
    }

    /// 模拟设备被拔出 / 恢复
    pub fn set_unavailable(&self, card: u32, device: u32, unavailable: bool) {
        let mut set = self.shared.unavailable.lock();
        if unavailable {
            set.insert((card, device));
        } else {
            set.remove(&(card, device));
        }
    }

    pub fn is_claimed(&self, card: u32, device: u32) -> bool {
        self.shared.claimed.lock().contains(&(card, device))
    }
}

impl Default for VirtualPcmBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PcmBackend for VirtualPcmBackend {
    type Handle = VirtualPcm;

    fn open(
        &self,
        card: u32,
        device: u32,
        flags: PcmFlags,
        config: &PcmConfiguration,
    ) -> Result<VirtualPcm, PcmError> {
        config.validate()?;

        let unavailable = |reason: &str| PcmError::DeviceUnavailable {
            card,
            device,
            reason: reason.to_string(),
        };

        if !flags.contains(PcmFlags::OUT) {
            return Err(unavailable("capture is not supported"));
        }
        if self.shared.unavailable.lock().contains(&(card, device)) {
            return Err(unavailable("no such device"));
        }
        if !self.shared.claimed.lock().insert((card, device)) {
            return Err(unavailable("device busy"));
        }

        let queue = Arc::new(PcmQueue::new(config.clone(), Arc::clone(&self.shared.stats)));
        let clock_queue = Arc::clone(&queue);
        let spawned = thread::Builder::new()
            .name(format!("pcm-clock-{}-{}", card, device))
            .spawn(move || run_period_clock(&clock_queue));

        let clock = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.claimed.lock().remove(&(card, device));
                return Err(unavailable(&format!("failed to spawn clock thread: {}", e)));
            }
        };

        log::debug!(
            "Virtual PCM {}:{} opened ({} ch, {} Hz, {}x{} frames)",
            card,
            device,
            config.channels,
            config.rate,
            config.period_size,
            config.period_count
        );

        Ok(VirtualPcm {
            queue,
            clock: Some(clock),
            key: (card, device),
            shared: Arc::clone(&self.shared),
        })
    }
}

/// 时钟线程：每个 period 消费一次，截止时间调度避免漂移
fn run_period_clock(queue: &PcmQueue) {
    let config = queue.config();
    let period = config.period_duration();
    let mut scratch = vec![0i32; config.period_size * config.channels as usize];
    let mut deadline = Instant::now() + period;

    while !queue.is_closed() {
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
        if queue.is_closed() {
            break;
        }

        queue.pull(&mut scratch, monotonic_now());
        deadline += period;

        let now = Instant::now();
        if now > deadline + period * MAX_CATCH_UP_PERIODS {
            log::debug!("PCM clock fell behind, realigning");
            deadline = now + period;
        }
    }
}

/// 已打开的虚拟 PCM
pub struct VirtualPcm {
    queue: Arc<PcmQueue>,
    clock: Option<JoinHandle<()>>,
    key: (u32, u32),
    shared: Arc<BackendShared>,
}

impl VirtualPcm {
    pub fn queue(&self) -> &PcmQueue {
        &self.queue
    }
}

impl PcmHandle for VirtualPcm {
    fn write(&mut self, samples: &[i32]) -> Result<(), PcmError> {
        self.queue.push(samples)
    }

    fn query_fill(&self) -> Result<FillLevel, PcmError> {
        self.queue.fill_level()
    }

    fn buffer_capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl Drop for VirtualPcm {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(handle) = self.clock.take() {
            if handle.join().is_err() {
                log::warn!("PCM clock thread panicked");
            }
        }
        self.shared.claimed.lock().remove(&self.key);
        log::debug!("Virtual PCM {}:{} closed", self.key.0, self.key.1);
    }
}
