//! 路由掩码、屏幕方向与混音器通路选择

use std::fmt;

use super::HalError;

/// 输出设备掩码
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OutputRoute(u32);

impl OutputRoute {
    pub const NONE: OutputRoute = OutputRoute(0);
    pub const EARPIECE: OutputRoute = OutputRoute(0x1);
    pub const SPEAKER: OutputRoute = OutputRoute(0x2);
    pub const WIRED_HEADSET: OutputRoute = OutputRoute(0x4);
    pub const WIRED_HEADPHONE: OutputRoute = OutputRoute(0x8);
    pub const BLUETOOTH_SCO: OutputRoute = OutputRoute(0x10);
    pub const BLUETOOTH_SCO_HEADSET: OutputRoute = OutputRoute(0x20);
    pub const BLUETOOTH_SCO_CARKIT: OutputRoute = OutputRoute(0x40);
    pub const ANLG_DOCK_HEADSET: OutputRoute = OutputRoute(0x800);

    /// 所有 SCO 设备
    pub const ALL_SCO: OutputRoute = OutputRoute(0x70);

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        OutputRoute(bits)
    }

    #[inline]
    pub const fn bits(&self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// 是否有任意一位重叠
    #[inline]
    pub const fn intersects(&self, other: OutputRoute) -> bool {
        self.0 & other.0 != 0
    }

    /// SCO 通路不经过普通的内核缓冲节流
    #[inline]
    pub const fn is_bypass(&self) -> bool {
        self.intersects(Self::ALL_SCO)
    }
}

impl std::ops::BitOr for OutputRoute {
    type Output = OutputRoute;

    fn bitor(self, rhs: OutputRoute) -> OutputRoute {
        OutputRoute(self.0 | rhs.0)
    }
}

impl fmt::Debug for OutputRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputRoute({:#x})", self.0)
    }
}

/// 输入设备掩码
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct InputRoute(u32);

impl InputRoute {
    pub const NONE: InputRoute = InputRoute(0);
    pub const BUILTIN_MIC: InputRoute = InputRoute(0x4);

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        InputRoute(bits)
    }

    #[inline]
    pub const fn bits(&self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn intersects(&self, other: InputRoute) -> bool {
        self.0 & other.0 != 0
    }
}

impl fmt::Debug for InputRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InputRoute({:#x})", self.0)
    }
}

/// 屏幕方向
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Orientation {
    Landscape,
    Portrait,
    Square,
    #[default]
    Undefined,
}

impl Orientation {
    /// 解析参数值，无法识别的值一律视为 Undefined
    pub fn parse(value: &str) -> Self {
        match value {
            "landscape" => Self::Landscape,
            "portrait" => Self::Portrait,
            "square" => Self::Square,
            _ => Self::Undefined,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Landscape => "landscape",
            Self::Portrait => "portrait",
            Self::Square => "square",
            Self::Undefined => "undefined",
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 混音器通路名
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MixerPaths {
    pub speaker: String,
    pub headphone: String,
    pub dock: String,
    /// 横屏时使用的麦克风
    pub mic_landscape: String,
    /// 其他方向使用的麦克风
    pub mic_default: String,
}

impl Default for MixerPaths {
    fn default() -> Self {
        Self {
            speaker: "speaker".into(),
            headphone: "headphone".into(),
            dock: "dock".into(),
            mic_landscape: "main-mic-left".into(),
            mic_default: "main-mic-top".into(),
        }
    }
}

impl MixerPaths {
    pub fn all(&self) -> [&str; 5] {
        [
            &self.speaker,
            &self.headphone,
            &self.dock,
            &self.mic_landscape,
            &self.mic_default,
        ]
    }
}

/// 混音器通路控制
///
/// 通路是叠加的：`reset` 清空暂存集合，`apply_path` 逐个加入，
/// `update` 一次性提交到硬件。
pub trait MixerControl: Send {
    fn reset(&mut self);

    fn apply_path(&mut self, name: &str) -> Result<(), HalError>;

    fn update(&mut self) -> Result<(), HalError>;

    /// 当前已提交的通路
    fn active_paths(&self) -> Vec<String>;
}

/// 按路由和方向推导需要打开的通路（顺序即应用顺序）
pub fn select_paths<'a>(
    out_route: OutputRoute,
    in_route: InputRoute,
    orientation: Orientation,
    paths: &'a MixerPaths,
) -> Vec<&'a str> {
    let mut selected = Vec::with_capacity(4);

    if out_route.intersects(OutputRoute::SPEAKER) {
        selected.push(paths.speaker.as_str());
    }
    if out_route.intersects(OutputRoute::WIRED_HEADSET | OutputRoute::WIRED_HEADPHONE) {
        selected.push(paths.headphone.as_str());
    }
    if out_route.intersects(OutputRoute::ANLG_DOCK_HEADSET) {
        selected.push(paths.dock.as_str());
    }
    if in_route.intersects(InputRoute::BUILTIN_MIC) {
        if orientation == Orientation::Landscape {
            selected.push(paths.mic_landscape.as_str());
        } else {
            selected.push(paths.mic_default.as_str());
        }
    }

    selected
}

/// 重新推导并提交混音器通路
///
/// 单个通路失败只记录日志，其余通路照常应用。
pub fn apply_routing(
    mixer: &mut dyn MixerControl,
    out_route: OutputRoute,
    in_route: InputRoute,
    orientation: Orientation,
    paths: &MixerPaths,
) -> Result<(), HalError> {
    let selected = select_paths(out_route, in_route, orientation, paths);

    mixer.reset();
    for path in &selected {
        if let Err(e) = mixer.apply_path(path) {
            log::warn!("Failed to apply mixer path '{}': {}", path, e);
        }
    }
    mixer.update()?;

    log::debug!(
        "Routing {:?} / {:?} / {}: paths {:?}",
        out_route,
        in_route,
        orientation,
        selected
    );
    Ok(())
}

/// 纯软件混音器：记录通路集合，不接触硬件
pub struct SoftMixer {
    known: Vec<String>,
    staged: Vec<String>,
    active: Vec<String>,
    commits: u64,
}

impl SoftMixer {
    /// `known`: 可用的通路名
    pub fn new<I, S>(known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: known.into_iter().map(Into::into).collect(),
            staged: Vec::new(),
            active: Vec::new(),
            commits: 0,
        }
    }

    /// 认识所有配置里出现的通路
    pub fn with_paths(paths: &MixerPaths) -> Self {
        Self::new(paths.all())
    }

    /// 提交次数
    pub fn commits(&self) -> u64 {
        self.commits
    }
}

impl MixerControl for SoftMixer {
    fn reset(&mut self) {
        self.staged.clear();
    }

    fn apply_path(&mut self, name: &str) -> Result<(), HalError> {
        if !self.known.iter().any(|p| p == name) {
            return Err(HalError::UnknownMixerPath(name.to_string()));
        }
        if !self.staged.iter().any(|p| p == name) {
            self.staged.push(name.to_string());
        }
        Ok(())
    }

    fn update(&mut self) -> Result<(), HalError> {
        self.active = self.staged.clone();
        self.commits += 1;
        Ok(())
    }

    fn active_paths(&self) -> Vec<String> {
        self.active.clone()
    }
}
