//! PCM Output HAL
//!
//! 把可变采样率的 PCM 生产者接到固定格式、固定 period 的硬件 ring buffer：
//! 声道缩减、重采样、standby 生命周期，以及写入前的内核缓冲填充控制。

pub mod audio;
pub mod decode;
pub mod engine;
pub mod resample;

#[cfg(test)]
mod test_support;
