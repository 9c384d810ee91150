//! 音频设备
//!
//! 持有路由状态（输出/输入掩码、屏幕方向、静音、熄屏）、混音器，
//! 并跟踪当前占用硬件的输出流。设备不拥有流的生命周期，
//! 只保存一个弱引用，用于路由变化时强制它进入 standby。
//!
//! 锁顺序：设备锁 → 流锁。需要同时持有两把锁的地方一律走 `lock_pair`；
//! 单独持有流锁的路径（位置查询等）不会再去拿设备锁。

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use super::params::{Params, KEY_ORIENTATION, KEY_ROUTING, KEY_SCREEN_STATE, VALUE_ON};
use super::route::{apply_routing, InputRoute, MixerControl, Orientation, OutputRoute};
use super::stream::{OutputStream, StreamState};
use super::{DeviceConfig, HalError};
use crate::audio::pcm::PcmBackend;
use crate::audio::timing::{Clock, MonotonicClock};
use crate::audio::AudioFormat;

/// 流的锁单元；流状态只能经由本模块的函数加锁
pub(crate) struct StreamCell<H> {
    pub(crate) id: u64,
    state: Mutex<StreamState<H>>,
}

impl<H> StreamCell<H> {
    pub(crate) fn new(id: u64, state: StreamState<H>) -> Self {
        Self {
            id,
            state: Mutex::new(state),
        }
    }

    /// 只拿流锁。持有期间不得再获取设备锁。
    pub(crate) fn lock_stream_only(&self) -> MutexGuard<'_, StreamState<H>> {
        self.state.lock()
    }
}

/// 按固定顺序持有的设备锁 + 流锁
pub(crate) struct LockedPair<'a, H> {
    pub(crate) device: MutexGuard<'a, DeviceState<H>>,
    pub(crate) stream: MutexGuard<'a, StreamState<H>>,
}

/// 先设备后流
pub(crate) fn lock_pair<'a, H>(
    device: &'a Mutex<DeviceState<H>>,
    cell: &'a StreamCell<H>,
) -> LockedPair<'a, H> {
    let device = device.lock();
    let stream = cell.state.lock();
    LockedPair { device, stream }
}

struct ActiveStream<H> {
    id: u64,
    cell: Weak<StreamCell<H>>,
}

/// 设备锁保护的状态
pub(crate) struct DeviceState<H> {
    pub(crate) out_route: OutputRoute,
    pub(crate) in_route: InputRoute,
    pub(crate) orientation: Orientation,
    pub(crate) mic_mute: bool,
    pub(crate) screen_off: bool,
    mixer: Box<dyn MixerControl>,
    active_out: Option<ActiveStream<H>>,
}

impl<H> DeviceState<H> {
    /// 当前占用硬件的流 id
    pub(crate) fn active_id(&self) -> Option<u64> {
        self.active_out.as_ref().map(|a| a.id)
    }

    pub(crate) fn set_active(&mut self, cell: &Arc<StreamCell<H>>) {
        self.active_out = Some(ActiveStream {
            id: cell.id,
            cell: Arc::downgrade(cell),
        });
    }

    /// 只有当前占用者是 `id` 时才清除
    pub(crate) fn clear_active(&mut self, id: u64) {
        if self.active_id() == Some(id) {
            self.active_out = None;
        }
    }

    /// 强制当前占用硬件的流（`except` 除外）进入 standby
    ///
    /// 调用方持有设备锁，这里再拿对方的流锁，顺序符合约定。
    pub(crate) fn standby_active(&mut self, except: Option<u64>) -> Option<u64> {
        let id = self.active_id()?;
        if Some(id) == except {
            return None;
        }

        let active = self.active_out.take()?;
        if let Some(cell) = active.cell.upgrade() {
            if cell.state.lock().release() {
                log::info!("Output stream {} forced into standby", id);
            }
        }
        Some(id)
    }

    fn reroute(&mut self, config: &DeviceConfig) -> Result<(), HalError> {
        apply_routing(
            self.mixer.as_mut(),
            self.out_route,
            self.in_route,
            self.orientation,
            &config.mixer_paths,
        )
    }

    /// 输出路由变化：先让占用硬件的流 standby，再切换通路
    ///
    /// 路由相同或为空时什么都不做，返回 false。
    pub(crate) fn change_output_route(
        &mut self,
        route: OutputRoute,
        config: &DeviceConfig,
    ) -> Result<bool, HalError> {
        if route == self.out_route || route.is_empty() {
            return Ok(false);
        }

        self.standby_active(None);
        log::info!("Output route {:?} -> {:?}", self.out_route, route);
        self.out_route = route;
        self.reroute(config)?;
        Ok(true)
    }
}

/// 设备与所有流共享的部分
pub(crate) struct DeviceShared<B: PcmBackend> {
    pub(crate) backend: B,
    pub(crate) config: DeviceConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) state: Mutex<DeviceState<B::Handle>>,
    next_stream_id: AtomicU64,
}

/// 主输出设备
pub struct AudioDevice<B: PcmBackend> {
    shared: Arc<DeviceShared<B>>,
}

impl<B: PcmBackend> Clone for AudioDevice<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: PcmBackend> AudioDevice<B> {
    pub fn new(
        backend: B,
        config: DeviceConfig,
        mixer: Box<dyn MixerControl>,
    ) -> Result<Self, HalError> {
        Self::with_clock(backend, config, mixer, Arc::new(MonotonicClock))
    }

    /// 指定时钟（写路径上的所有睡眠都经过它）
    pub fn with_clock(
        backend: B,
        config: DeviceConfig,
        mixer: Box<dyn MixerControl>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, HalError> {
        config.validate()?;

        let mut state = DeviceState {
            out_route: config.initial_route,
            in_route: InputRoute::BUILTIN_MIC,
            orientation: Orientation::Undefined,
            mic_mute: false,
            screen_off: false,
            mixer,
            active_out: None,
        };
        state.reroute(&config)?;

        log::info!(
            "Audio device ready: PCM {}:{}, {} ch @ {} Hz, period {} x {}",
            config.card,
            config.device,
            config.pcm.channels,
            config.pcm.rate,
            config.pcm.period_size,
            config.pcm.period_count
        );

        Ok(Self {
            shared: Arc::new(DeviceShared {
                backend,
                config,
                clock,
                state: Mutex::new(state),
                next_stream_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    pub fn init_check(&self) -> Result<(), HalError> {
        Ok(())
    }

    // ========== 路由 ==========

    /// 切换输出路由
    ///
    /// 路由与当前不同且非空时：强制占用硬件的流 standby，
    /// 更新路由并重新推导混音器通路。返回是否发生了切换。
    pub fn set_output_route(&self, route: OutputRoute) -> Result<bool, HalError> {
        let mut state = self.shared.state.lock();
        state.change_output_route(route, &self.shared.config)
    }

    pub fn output_route(&self) -> OutputRoute {
        self.shared.state.lock().out_route
    }

    pub fn input_route(&self) -> InputRoute {
        self.shared.state.lock().in_route
    }

    /// 更新屏幕方向；只在变化时重新推导通路，不影响正在播放的流
    pub fn set_orientation(&self, orientation: Orientation) -> Result<(), HalError> {
        let mut state = self.shared.state.lock();
        if state.orientation == orientation {
            return Ok(());
        }
        log::debug!("Orientation {} -> {}", state.orientation, orientation);
        state.orientation = orientation;
        state.reroute(&self.shared.config)
    }

    pub fn orientation(&self) -> Orientation {
        self.shared.state.lock().orientation
    }

    pub fn set_screen_on(&self, on: bool) {
        let off = !on;
        let mut state = self.shared.state.lock();
        if state.screen_off != off {
            log::debug!("Screen {}", if on { "on" } else { "off" });
        }
        state.screen_off = off;
    }

    pub fn is_screen_off(&self) -> bool {
        self.shared.state.lock().screen_off
    }

    /// 当前已提交的混音器通路
    pub fn active_paths(&self) -> Vec<String> {
        self.shared.state.lock().mixer.active_paths()
    }

    /// 是否有流占用硬件
    pub fn has_active_stream(&self) -> bool {
        self.shared.state.lock().active_id().is_some()
    }

    // ========== 参数 ==========

    /// 处理 `orientation=`、`screen_state=`、`routing=`
    pub fn set_parameters(&self, kvpairs: &str) -> Result<(), HalError> {
        let params = Params::parse(kvpairs);

        if let Some(value) = params.get(KEY_ORIENTATION) {
            self.set_orientation(Orientation::parse(value))?;
        }
        if let Some(value) = params.get(KEY_SCREEN_STATE) {
            self.set_screen_on(value == VALUE_ON);
        }
        if let Some(value) = params.get_u32(KEY_ROUTING) {
            let bits = value.map_err(|e| HalError::InvalidParameter(format!("routing: {}", e)))?;
            self.set_output_route(OutputRoute::from_bits(bits))?;
        }
        Ok(())
    }

    pub fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }

    // ========== 其他设备接口 ==========

    pub fn set_mic_mute(&self, mute: bool) {
        self.shared.state.lock().mic_mute = mute;
    }

    pub fn mic_mute(&self) -> bool {
        self.shared.state.lock().mic_mute
    }

    /// 接受任何模式，不做处理
    pub fn set_mode(&self, _mode: i32) -> Result<(), HalError> {
        Ok(())
    }

    pub fn set_voice_volume(&self, _volume: f32) -> Result<(), HalError> {
        Err(HalError::UnsupportedOperation("set_voice_volume"))
    }

    pub fn set_master_volume(&self, _volume: f32) -> Result<(), HalError> {
        Err(HalError::UnsupportedOperation("set_master_volume"))
    }

    /// 没有录音通路
    pub fn get_input_buffer_size(&self, _format: &AudioFormat) -> usize {
        0
    }

    pub fn open_input_stream(&self, _format: &AudioFormat) -> Result<(), HalError> {
        Err(HalError::UnsupportedOperation("open_input_stream"))
    }

    // ========== 输出流 ==========

    /// 打开输出流（处于 standby，第一次写入时才占用硬件）
    ///
    /// `requested` 能被写路径处理时采用，否则使用默认流格式；
    /// 实际格式通过 `OutputStream::format` 返回。
    pub fn open_output_stream(
        &self,
        requested: Option<AudioFormat>,
    ) -> Result<OutputStream<B>, HalError> {
        let config = &self.shared.config;
        let format = match requested {
            Some(format) if config.accepts_stream_format(&format) => format,
            Some(format) => {
                log::debug!(
                    "Requested format {:?} not supported, using {:?}",
                    format,
                    config.default_stream_format
                );
                config.default_stream_format
            }
            None => config.default_stream_format,
        };

        let id = self.shared.next_stream_id.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Opened output stream {}: {} Hz, {} ch, {}-bit",
            id,
            format.sample_rate,
            format.channels,
            format.bits_per_sample
        );
        Ok(OutputStream::new(Arc::clone(&self.shared), id, format))
    }

    /// 关闭输出流（standby 后释放）
    pub fn close_output_stream(&self, stream: OutputStream<B>) {
        stream.close();
    }

    /// 诊断信息
    pub fn dump(&self) -> String {
        let state = self.shared.state.lock();
        let mut out = String::new();
        let _ = writeln!(out, "out_route: {:?}", state.out_route);
        let _ = writeln!(out, "in_route: {:?}", state.in_route);
        let _ = writeln!(out, "orientation: {}", state.orientation);
        let _ = writeln!(out, "mic_mute: {}", state.mic_mute);
        let _ = writeln!(out, "screen_off: {}", state.screen_off);
        let _ = writeln!(out, "active_out: {:?}", state.active_id());
        let _ = write!(out, "mixer_paths: {:?}", state.mixer.active_paths());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::route::SoftMixer;
    use crate::test_support::{ManualClock, MockBackend};

    fn device() -> (AudioDevice<MockBackend>, MockBackend) {
        let backend = MockBackend::new();
        let config = DeviceConfig::default();
        let mixer = Box::new(SoftMixer::with_paths(&config.mixer_paths));
        let device = AudioDevice::with_clock(
            backend.clone(),
            config,
            mixer,
            Arc::new(ManualClock::new()),
        )
        .unwrap();
        (device, backend)
    }

    #[test]
    fn test_initial_state() {
        let (device, _) = device();
        assert!(device.init_check().is_ok());
        assert_eq!(device.output_route(), OutputRoute::SPEAKER);
        assert_eq!(device.input_route(), InputRoute::BUILTIN_MIC);
        assert_eq!(device.orientation(), Orientation::Undefined);
        assert_eq!(device.active_paths(), ["speaker", "main-mic-top"]);
        assert!(!device.has_active_stream());
    }

    #[test]
    fn test_route_change_rules() {
        let (device, _) = device();
        assert_eq!(device.set_output_route(OutputRoute::SPEAKER), Ok(false));
        assert_eq!(device.set_output_route(OutputRoute::NONE), Ok(false));
        assert_eq!(device.output_route(), OutputRoute::SPEAKER);

        assert_eq!(device.set_output_route(OutputRoute::WIRED_HEADPHONE), Ok(true));
        assert_eq!(device.active_paths(), ["headphone", "main-mic-top"]);
    }

    #[test]
    fn test_parameters() {
        let (device, _) = device();

        device.set_parameters("orientation=landscape").unwrap();
        assert_eq!(device.orientation(), Orientation::Landscape);
        assert_eq!(device.active_paths(), ["speaker", "main-mic-left"]);

        device.set_parameters("orientation=sideways").unwrap();
        assert_eq!(device.orientation(), Orientation::Undefined);
        assert_eq!(device.active_paths(), ["speaker", "main-mic-top"]);

        device.set_parameters("screen_state=off").unwrap();
        assert!(device.is_screen_off());
        device.set_parameters("screen_state=on").unwrap();
        assert!(!device.is_screen_off());

        device.set_parameters("routing=2056").unwrap();
        assert_eq!(
            device.output_route(),
            OutputRoute::WIRED_HEADPHONE | OutputRoute::ANLG_DOCK_HEADSET
        );
        assert!(matches!(
            device.set_parameters("routing=loud"),
            Err(HalError::InvalidParameter(_))
        ));
        assert_eq!(device.get_parameters("routing"), "");
    }

    #[test]
    fn test_unsupported_and_noop_calls() {
        let (device, _) = device();
        let format = AudioFormat::new(16_000, 1, 16);

        assert!(device.set_mode(2).is_ok());
        assert!(matches!(
            device.set_voice_volume(0.5),
            Err(HalError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            device.set_master_volume(0.5),
            Err(HalError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            device.open_input_stream(&format),
            Err(HalError::UnsupportedOperation(_))
        ));
        assert_eq!(device.get_input_buffer_size(&format), 0);

        device.set_mic_mute(true);
        assert!(device.mic_mute());
    }

    #[test]
    fn test_open_output_stream_negotiation() {
        let (device, backend) = device();

        let default = device.open_output_stream(None).unwrap();
        assert_eq!(default.format(), AudioFormat::new(48_000, 2, 32));

        let wanted = AudioFormat::new(44_100, 2, 16);
        let custom = device.open_output_stream(Some(wanted)).unwrap();
        assert_eq!(custom.format(), wanted);

        let mono = device.open_output_stream(Some(AudioFormat::new(44_100, 1, 16))).unwrap();
        assert_eq!(mono.format(), AudioFormat::new(48_000, 2, 32));

        // 打开流不占用硬件
        assert_eq!(backend.opens(), 0);
        assert!(custom.is_standby());
    }

    #[test]
    fn test_dump_lists_state() {
        let (device, _) = device();
        let text = device.dump();
        assert!(text.contains("orientation: undefined"));
        assert!(text.contains("active_out: None"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = DeviceConfig::default();
        config.pcm.rate = 0;
        let result = AudioDevice::new(
            MockBackend::new(),
            config,
            Box::new(SoftMixer::new(Vec::<String>::new())),
        );
        assert!(matches!(result, Err(HalError::InvalidParameter(_))));
    }
}
