//! 输出流
//!
//! 写路径：
//! ```text
//! bytes → i32 样本 → 声道缩减 → 重采样 → 节流 → PCM 阻塞写入
//! ```
//!
//! 流在 standby 时不持有 PCM；第一次写入才打开硬件并成为设备的
//! 当前输出流。`written` 只增不减，跨 standby 保留。

use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;

use super::device::{lock_pair, DeviceShared, StreamCell};
use super::fill::{BufferType, FillController};
use super::params::{Params, KEY_ROUTING};
use super::route::OutputRoute;
use super::HalError;
use crate::audio::format::keep_leading_channels;
use crate::audio::pcm::{PcmBackend, PcmError, PcmFlags, PcmHandle};
use crate::audio::timing::{Clock, Timestamp};
use crate::audio::AudioFormat;
use crate::resample::{create_resampler, output_capacity, Resampler};

/// 流锁保护的状态
pub(crate) struct StreamState<H> {
    /// 累计写入硬件的帧数（硬件采样率）
    written: u64,
    /// None = standby
    pcm: Option<H>,
    resampler: Option<Box<dyn Resampler>>,
    /// 重采样输出
    scratch: Vec<i32>,
    /// 解码后的输入样本
    samples: Vec<i32>,
    fill: FillController,
}

impl<H> StreamState<H> {
    fn new(fill: FillController) -> Self {
        Self {
            written: 0,
            pcm: None,
            resampler: None,
            scratch: Vec::new(),
            samples: Vec::new(),
            fill,
        }
    }

    /// 进入 standby：关闭 PCM，释放重采样器和缓冲。已经在 standby 时返回 false。
    pub(crate) fn release(&mut self) -> bool {
        self.resampler = None;
        self.scratch = Vec::new();
        self.samples = Vec::new();
        self.pcm.take().is_some()
    }
}

/// 写路径上被分别借用的字段
struct WriteContext<'a, H> {
    format: AudioFormat,
    hw_channels: usize,
    hw_rate: u32,
    pcm: &'a mut H,
    resampler: Option<&'a mut Box<dyn Resampler>>,
    samples: &'a mut Vec<i32>,
    scratch: &'a mut Vec<i32>,
    fill: &'a mut FillController,
}

/// 输出流
pub struct OutputStream<B: PcmBackend> {
    shared: Arc<DeviceShared<B>>,
    cell: Arc<StreamCell<B::Handle>>,
    format: AudioFormat,
    id: u64,
    /// 最近一次写入被吞掉的硬件错误；不与设备锁、流锁同时持有
    last_error: Mutex<Option<HalError>>,
}

impl<B: PcmBackend> OutputStream<B> {
    pub(crate) fn new(shared: Arc<DeviceShared<B>>, id: u64, format: AudioFormat) -> Self {
        let config = &shared.config;
        let fill = FillController::new(&config.pcm, config.tuning);
        let cell = Arc::new(StreamCell::new(id, StreamState::new(fill)));
        Self {
            shared,
            cell,
            format,
            id,
            last_error: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.format.channels
    }

    /// 建议的单次写入大小（字节）：一个 period，按流格式计
    pub fn buffer_size(&self) -> usize {
        self.shared.config.pcm.period_size * self.format.bytes_per_frame()
    }

    /// 当前区间下的硬件延迟（毫秒）
    pub fn latency_ms(&self) -> u32 {
        let config = &self.shared.config;
        let screen_off = self.shared.state.lock().screen_off;
        let periods = config
            .tuning
            .period_count_for(config.buffer_policy.select(screen_off));
        (config.pcm.period_size * periods * 1000 / config.pcm.rate as usize) as u32
    }

    pub fn set_sample_rate(&self, _rate: u32) -> Result<(), HalError> {
        Err(HalError::UnsupportedOperation("set_sample_rate"))
    }

    pub fn set_format(&self, _format: AudioFormat) -> Result<(), HalError> {
        Err(HalError::UnsupportedOperation("set_format"))
    }

    pub fn set_volume(&self, _left: f32, _right: f32) -> Result<(), HalError> {
        Err(HalError::UnsupportedOperation("set_volume"))
    }

    pub fn render_position(&self) -> Result<u32, HalError> {
        Err(HalError::UnsupportedOperation("render_position"))
    }

    pub fn next_write_timestamp(&self) -> Result<i64, HalError> {
        Err(HalError::UnsupportedOperation("next_write_timestamp"))
    }

    /// 不做音效处理，接受即可
    pub fn add_audio_effect(&self, _effect: u64) -> Result<(), HalError> {
        Ok(())
    }

    pub fn remove_audio_effect(&self, _effect: u64) -> Result<(), HalError> {
        Ok(())
    }

    /// 只处理 `routing=`，其余键忽略
    pub fn set_parameters(&self, kvpairs: &str) -> Result<(), HalError> {
        let params = Params::parse(kvpairs);
        if let Some(value) = params.get_u32(KEY_ROUTING) {
            let bits = value.map_err(|e| HalError::InvalidParameter(format!("routing: {}", e)))?;
            let mut device = self.shared.state.lock();
            device.change_output_route(OutputRoute::from_bits(bits), &self.shared.config)?;
        }
        Ok(())
    }

    pub fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }

    /// 累计写入硬件的帧数
    pub fn frames_written(&self) -> u64 {
        self.cell.lock_stream_only().written
    }

    pub fn is_standby(&self) -> bool {
        self.cell.lock_stream_only().pcm.is_none()
    }

    /// 进入 standby（可重复调用）
    pub fn standby(&self) {
        let mut pair = lock_pair(&self.shared.state, &self.cell);
        if pair.stream.release() {
            log::debug!("Output stream {} standby", self.id);
        }
        pair.device.clear_active(self.id);
    }

    /// 关闭流
    pub fn close(self) {
        // Drop 负责 standby
    }

    /// 已被硬件播放的帧数及对应的时间戳
    ///
    /// 帧数 = 已写入 − 内核中尚未播放的帧数。standby 时没有遥测。
    pub fn presentation_position(&self) -> Result<(u64, Timestamp), HalError> {
        let stream = self.cell.lock_stream_only();
        let pcm = stream.pcm.as_ref().ok_or(HalError::TelemetryUnavailable)?;
        let level = pcm.query_fill()?;

        let queued = level.queued(pcm.buffer_capacity()) as u64;
        let frames = stream
            .written
            .checked_sub(queued)
            .ok_or(HalError::InvalidState("more frames queued than written"))?;
        Ok((frames, level.timestamp))
    }

    pub fn dump(&self) -> String {
        let stream = self.cell.lock_stream_only();
        let mut out = String::new();
        let _ = writeln!(out, "stream {}: {:?}", self.id, self.format);
        let _ = writeln!(out, "standby: {}", stream.pcm.is_none());
        let _ = writeln!(out, "written: {}", stream.written);
        let _ = write!(
            out,
            "buffer: {:?}, threshold {}/{}",
            stream.fill.buffer_type(),
            stream.fill.cur_write_threshold(),
            stream.fill.write_threshold()
        );
        out
    }

    /// 写入交错 PCM 数据
    ///
    /// 返回被消费的字节数。硬件打不开或写入失败时，先按这段数据的
    /// 播放时长睡眠，再同样返回 `bytes.len()`；错误本身通过
    /// `last_error` 取得。欠载不睡眠，直接返回 `HalError::Underrun`。
    pub fn write(&self, bytes: &[u8]) -> Result<usize, HalError> {
        let result = self.write_inner(bytes);
        let error = match result {
            Ok(()) => None,
            Err(HalError::Underrun) => {
                log::debug!("Output stream {} underrun", self.id);
                *self.last_error.lock() = None;
                return Err(HalError::Underrun);
            }
            Err(e) => {
                log::warn!("Output stream {} write failed: {}", self.id, e);
                // 锁已经释放
                self.shared.clock.sleep_us(self.format.duration_us(bytes.len()));
                Some(e)
            }
        };
        *self.last_error.lock() = error;
        Ok(bytes.len())
    }

    /// 最近一次 `write` 吞掉的硬件错误（成功写入后清空）
    pub fn last_error(&self) -> Option<HalError> {
        self.last_error.lock().clone()
    }

    fn write_inner(&self, bytes: &[u8]) -> Result<(), HalError> {
        let config = &self.shared.config;
        let mut pair = lock_pair(&self.shared.state, &self.cell);

        if pair.stream.pcm.is_none() {
            // 别的流占着硬件时先让它 standby
            pair.device.standby_active(Some(self.id));
            self.start(&mut pair.stream)?;
            pair.device.set_active(&self.cell);
        }

        let bypass = pair.device.out_route.is_bypass();
        let buffer_type = config.buffer_policy.select(pair.device.screen_off);
        drop(pair.device);

        let stream = &mut *pair.stream;
        let Some(pcm) = stream.pcm.as_mut() else {
            return Err(HalError::InvalidState("stream not started"));
        };
        let ctx = WriteContext {
            format: self.format,
            hw_channels: config.pcm.channels as usize,
            hw_rate: config.pcm.rate,
            pcm,
            resampler: stream.resampler.as_mut(),
            samples: &mut stream.samples,
            scratch: &mut stream.scratch,
            fill: &mut stream.fill,
        };
        let frames = ctx.run(bytes, self.shared.clock.as_ref(), buffer_type, bypass)?;
        stream.written += frames as u64;
        Ok(())
    }

    /// 离开 standby：打开 PCM，按需创建重采样器
    fn start(&self, stream: &mut StreamState<B::Handle>) -> Result<(), HalError> {
        let config = &self.shared.config;
        let flags = PcmFlags::OUT | PcmFlags::NORESTART | PcmFlags::MONOTONIC;

        let pcm = self
            .shared
            .backend
            .open(config.card, config.device, flags, &config.pcm)
            .map_err(HalError::HardwareUnavailable)?;

        let hw_channels = config.pcm.channels as usize;
        stream.resampler = if self.format.sample_rate != config.pcm.rate {
            Some(create_resampler(
                self.format.sample_rate,
                config.pcm.rate,
                hw_channels,
                config.resampler,
            )?)
        } else {
            None
        };

        let scratch_frames =
            output_capacity(config.pcm.period_size, self.format.sample_rate, config.pcm.rate);
        stream.scratch.resize(scratch_frames * hw_channels, 0);
        stream.fill.reset();
        stream.pcm = Some(pcm);

        log::info!(
            "Output stream {} started: {} Hz -> {} Hz, {} ch -> {} ch",
            self.id,
            self.format.sample_rate,
            config.pcm.rate,
            self.format.channels,
            config.pcm.channels
        );
        Ok(())
    }
}

impl<H: PcmHandle> WriteContext<'_, H> {
    /// 返回写入硬件的帧数
    fn run(
        self,
        bytes: &[u8],
        clock: &dyn Clock,
        buffer_type: BufferType,
        bypass: bool,
    ) -> Result<usize, HalError> {
        let in_channels = self.format.channels as usize;
        let in_frames = self.format.frames_in(bytes.len());

        self.samples.resize(in_frames * in_channels, 0);
        self.format.bytes_to_samples(bytes, self.samples);
        let len = keep_leading_channels(self.samples, in_channels, self.hw_channels);

        let out: &[i32] = match self.resampler {
            Some(resampler) => {
                let needed = output_capacity(in_frames, self.format.sample_rate, self.hw_rate)
                    * self.hw_channels;
                if self.scratch.len() < needed {
                    self.scratch.resize(needed, 0);
                }
                let (consumed, produced) =
                    resampler.resample_from_input(&self.samples[..len], self.scratch);
                if consumed < in_frames {
                    log::trace!("Resampler consumed {} of {} frames", consumed, in_frames);
                }
                &self.scratch[..produced * self.hw_channels]
            }
            None => &self.samples[..len],
        };
        let out_frames = out.len() / self.hw_channels;

        self.fill.before_write(&*self.pcm, clock, buffer_type, bypass);

        self.pcm.write(out).map_err(|e| match e {
            PcmError::Underrun => HalError::Underrun,
            other => HalError::HardwareUnavailable(other),
        })?;
        Ok(out_frames)
    }
}

impl<B: PcmBackend> Drop for OutputStream<B> {
    fn drop(&mut self) {
        self.standby();
    }
}
