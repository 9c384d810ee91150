//! 测试辅助：可编排的 PCM 后端和手动时钟

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::audio::pcm::{FillLevel, PcmBackend, PcmConfiguration, PcmError, PcmFlags, PcmHandle};
use crate::audio::timing::{Clock, Timestamp};

#[derive(Default)]
pub struct MockState {
    /// 依次返回的 avail 值（None = 遥测失败），用完后返回 `avail`
    pub fill_script: VecDeque<Option<usize>>,
    pub avail: Option<usize>,
    /// 依次返回的写入结果，用完后返回 Ok
    pub write_script: VecDeque<Result<(), PcmError>>,
    /// 接下来这么多次 open 失败
    pub fail_opens: usize,

    pub opens: usize,
    pub closes: usize,
    pub fill_queries: usize,
    pub open_flags: Option<PcmFlags>,
    /// 每次 write 的帧数
    pub writes: Vec<usize>,
    /// 写入的全部样本
    pub samples: Vec<i32>,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    pub state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_avail(&self, avail: Option<usize>) {
        self.state.lock().avail = avail;
    }

    pub fn script_fill(&self, values: &[Option<usize>]) {
        self.state.lock().fill_script.extend(values.iter().copied());
    }

    pub fn script_write(&self, result: Result<(), PcmError>) {
        self.state.lock().write_script.push_back(result);
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().fail_opens = count;
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }

    pub fn writes(&self) -> Vec<usize> {
        self.state.lock().writes.clone()
    }

    pub fn samples(&self) -> Vec<i32> {
        self.state.lock().samples.clone()
    }
}

impl PcmBackend for MockBackend {
    type Handle = MockPcm;

    fn open(
        &self,
        card: u32,
        device: u32,
        flags: PcmFlags,
        config: &PcmConfiguration,
    ) -> Result<MockPcm, PcmError> {
        let mut state = self.state.lock();
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(PcmError::DeviceUnavailable {
                card,
                device,
                reason: "scripted failure".into(),
            });
        }
        state.opens += 1;
        state.open_flags = Some(flags);

        Ok(MockPcm {
            state: Arc::clone(&self.state),
            capacity: config.buffer_frames(),
            channels: config.channels as usize,
        })
    }
}

pub struct MockPcm {
    state: Arc<Mutex<MockState>>,
    capacity: usize,
    channels: usize,
}

impl PcmHandle for MockPcm {
    fn write(&mut self, samples: &[i32]) -> Result<(), PcmError> {
        let mut state = self.state.lock();
        if let Some(result) = state.write_script.pop_front() {
            result?;
        }
        state.writes.push(samples.len() / self.channels);
        state.samples.extend_from_slice(samples);
        Ok(())
    }

    fn query_fill(&self) -> Result<FillLevel, PcmError> {
        let mut state = self.state.lock();
        state.fill_queries += 1;
        let avail = match state.fill_script.pop_front() {
            Some(scripted) => scripted,
            None => state.avail,
        };
        avail
            .map(|avail| FillLevel {
                avail,
                timestamp: Timestamp::new(1, 0),
            })
            .ok_or(PcmError::TelemetryUnavailable)
    }

    fn buffer_capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for MockPcm {
    fn drop(&mut self) {
        self.state.lock().closes += 1;
    }
}

/// 只记录不睡眠的时钟
#[derive(Default)]
pub struct ManualClock {
    now_ns: Mutex<u64>,
    sleeps: Mutex<Vec<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<u64> {
        self.sleeps.lock().clone()
    }

    pub fn total_slept_us(&self) -> u64 {
        self.sleeps.lock().iter().sum()
    }

    pub fn clear(&self) {
        self.sleeps.lock().clear();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(*self.now_ns.lock())
    }

    fn sleep_us(&self, us: u64) {
        self.sleeps.lock().push(us);
        *self.now_ns.lock() += us * 1_000;
    }
}
