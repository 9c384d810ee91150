//! cpal 声卡后端
//!
//! cpal 的回调式输出被包装成阻塞写入的 PCM：写线程 push 到 `PcmQueue`，
//! 声卡回调每次 pull 一块。`cpal::Stream` 不是 `Send`，
//! 所以放在专用线程上创建和持有，句柄 drop 时通知该线程退出。

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;

use super::pcm::{
    FillLevel, PcmBackend, PcmConfiguration, PcmError, PcmFlags, PcmHandle, PcmQueue,
};
use super::stats::PlaybackStats;
use super::timing::monotonic_now;

/// i32 满幅 → f32 [-1.0, 1.0)
const I32_SCALE: f32 = 1.0 / 2_147_483_648.0;

/// cpal 输出设备（card 编号对应 cpal 输出设备枚举顺序）
pub struct CpalPcmBackend {
    /// 指定设备名，`None` 使用默认输出设备
    device_name: Option<String>,
    claimed: Arc<Mutex<Option<(u32, u32)>>>,
    stats: Arc<PlaybackStats>,
}

impl CpalPcmBackend {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            claimed: Arc::new(Mutex::new(None)),
            stats: Arc::new(PlaybackStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<PlaybackStats> {
        Arc::clone(&self.stats)
    }

    fn find_device(&self) -> Result<cpal::Device, String> {
        let host = cpal::default_host();
        match &self.device_name {
            None => host
                .default_output_device()
                .ok_or_else(|| "no default output device".to_string()),
            Some(name) => host
                .output_devices()
                .map_err(|e| format!("failed to enumerate devices: {}", e))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| format!("output device '{}' not found", name)),
        }
    }
}

impl PcmBackend for CpalPcmBackend {
    type Handle = CpalPcm;

    fn open(
        &self,
        card: u32,
        device: u32,
        flags: PcmFlags,
        config: &PcmConfiguration,
    ) -> Result<CpalPcm, PcmError> {
        config.validate()?;

        let unavailable = |reason: String| PcmError::DeviceUnavailable {
            card,
            device,
            reason,
        };

        if !flags.contains(PcmFlags::OUT) {
            return Err(unavailable("capture is not supported".into()));
        }

        {
            let mut claimed = self.claimed.lock();
            if claimed.is_some() {
                return Err(unavailable("device busy".into()));
            }
            *claimed = Some((card, device));
        }

        let release = |err: PcmError| {
            *self.claimed.lock() = None;
            err
        };

        let hw = self.find_device().map_err(|e| release(unavailable(e)))?;
        let queue = Arc::new(PcmQueue::new(config.clone(), Arc::clone(&self.stats)));

        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), String>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let stream_queue = Arc::clone(&queue);
        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.rate),
            buffer_size: cpal::BufferSize::Fixed(config.period_size as u32),
        };

        let spawned = thread::Builder::new()
            .name("pcm-cpal".to_string())
            .spawn(move || {
                let stream = match build_stream(&hw, &stream_config, stream_queue) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(format!("failed to start stream: {}", e)));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // 句柄 drop 时 sender 被释放，recv 返回 Err
                let _ = stop_rx.recv();
                drop(stream);
            });

        let thread = spawned
            .map_err(|e| release(unavailable(format!("failed to spawn stream thread: {}", e))))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                let _ = thread.join();
                return Err(release(unavailable(reason)));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(release(unavailable("stream thread exited".into())));
            }
        }

        log::info!(
            "cpal PCM opened ({} ch, {} Hz, period {} frames)",
            config.channels,
            config.rate,
            config.period_size
        );

        Ok(CpalPcm {
            queue,
            stop: Some(stop_tx),
            thread: Some(thread),
            claimed: Arc::clone(&self.claimed),
        })
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: Arc<PcmQueue>,
) -> Result<cpal::Stream, String> {
    let channels = config.channels as usize;
    let period = queue.config().period_size;
    let mut scratch = vec![0i32; period * channels * 4];

    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if scratch.len() < data.len() {
                    scratch.resize(data.len(), 0);
                }
                let block = &mut scratch[..data.len()];
                queue.pull(block, monotonic_now());
                for (out, &sample) in data.iter_mut().zip(block.iter()) {
                    *out = sample as f32 * I32_SCALE;
                }
            },
            |err| log::error!("cpal stream error: {}", err),
            None,
        )
        .map_err(|e| format!("failed to build stream: {}", e))
}

/// 已打开的 cpal PCM
pub struct CpalPcm {
    queue: Arc<PcmQueue>,
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    claimed: Arc<Mutex<Option<(u32, u32)>>>,
}

impl PcmHandle for CpalPcm {
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

impl Drop for CpalPcm {
    fn drop(&mut self) {
        self.queue.close();
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("cpal stream thread panicked");
            }
        }
        *self.claimed.lock() = None;
        log::debug!("cpal PCM closed");
    }
}
