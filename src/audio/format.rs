//! 流格式、样本编解码与声道缩减
//!
//! 内部表示：所有位深统一左对齐到 i32 的高位
//! - 16-bit: 占据 bit[31:16]，bit[15:0] = 0
//! - 24-bit: 占据 bit[31:8]，bit[7:0] = 0
//! - 32-bit: 占据 bit[31:0]
//!
//! 硬件格式固定为 S32_LE，所以写路径解码后的 i32 样本可以直接送入 PCM。

/// 流格式（调用方写入的交错 PCM 数据的布局）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// 是否为写路径支持的格式
    pub fn is_supported(&self) -> bool {
        self.sample_rate > 0
            && self.channels > 0
            && matches!(self.bits_per_sample, 16 | 24 | 32)
    }

    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// 字节数对应的完整帧数（不足一帧的尾部被截断）
    #[inline]
    pub fn frames_in(&self, bytes: usize) -> usize {
        match self.bytes_per_frame() {
            0 => 0,
            frame => bytes / frame,
        }
    }

    /// 按本格式的采样率播放 `bytes` 字节所需的微秒数
    pub fn duration_us(&self, bytes: usize) -> u64 {
        let frame = self.bytes_per_frame() as u64;
        if frame == 0 || self.sample_rate == 0 {
            return 0;
        }
        bytes as u64 * 1_000_000 / frame / self.sample_rate as u64
    }

    /// 将原始字节解码为 i32 样本（左对齐到 32-bit）
    ///
    /// 返回写入 `output` 的样本数
    pub fn bytes_to_samples(&self, bytes: &[u8], output: &mut [i32]) -> usize {
        let width = self.bytes_per_sample();
        if width == 0 {
            return 0;
        }

        let mut count = 0;
        for (chunk, out) in bytes.chunks_exact(width).zip(output.iter_mut()) {
            *out = match width {
                2 => (i16::from_le_bytes([chunk[0], chunk[1]]) as i32) << 16,
                3 => {
                    // 先把 24-bit 放进高 24 位，符号位自然落在 bit31
                    (chunk[0] as i32) << 8 | (chunk[1] as i32) << 16 | (chunk[2] as i32) << 24
                }
                4 => i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                _ => 0,
            };
            count += 1;
        }
        count
    }

    /// 将 i32 样本（左对齐）按本格式打包为字节
    ///
    /// 返回写入 `output` 的字节数
    pub fn samples_to_bytes(&self, samples: &[i32], output: &mut [u8]) -> usize {
        let width = self.bytes_per_sample();
        if width == 0 {
            return 0;
        }

        let mut written = 0;
        for (&sample, out) in samples.iter().zip(output.chunks_exact_mut(width)) {
            let le = sample.to_le_bytes();
            // 左对齐表示下，高位字节就是目标位深的有效数据
            out.copy_from_slice(&le[4 - width..]);
            written += width;
        }
        written
    }
}

/// 声道缩减：每帧只保留前 `out_channels` 个声道
///
/// 立体声 → 单声道时保留左声道，不做加权混音。
/// 原地操作，返回缩减后的样本数。
pub fn keep_leading_channels(
    samples: &mut [i32],
    in_channels: usize,
    out_channels: usize,
) -> usize {
    if in_channels == 0 || out_channels == 0 || out_channels >= in_channels {
        return samples.len();
    }

    let frames = samples.len() / in_channels;
    for frame in 0..frames {
        for ch in 0..out_channels {
            samples[frame * out_channels + ch] = samples[frame * in_channels + ch];
        }
    }
    frames * out_channels
}
