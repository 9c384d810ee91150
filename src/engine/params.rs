//! `key=value;key2=value2` 形式的参数串

use std::fmt;

/// 输出路由键
pub const KEY_ROUTING: &str = "routing";
/// 屏幕方向键
pub const KEY_ORIENTATION: &str = "orientation";
/// 屏幕状态键
pub const KEY_SCREEN_STATE: &str = "screen_state";

pub const VALUE_ON: &str = "on";
pub const VALUE_OFF: &str = "off";

/// 解析后的参数集合（保留原始顺序，重复键以最后一次为准）
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params {
    pairs: Vec<(String, String)>,
}

impl Params {
    pub fn parse(input: &str) -> Self {
        let mut params = Params::default();
        for item in input.split(';') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (item, ""),
            };
            if key.is_empty() {
                continue;
            }
            params.set(key, value);
        }
        params
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.pairs.push((key.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// 整数值；存在但无法解析时返回 `Some(Err)`
    pub fn get_u32(&self, key: &str) -> Option<Result<u32, std::num::ParseIntError>> {
        self.get(key).map(|v| v.parse::<u32>())
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}
