//! 定点线性插值重采样
//!
//! 位置用 32.32 定点数表示，整数部分 0 指向上一块的最后一帧，
//! k (k >= 1) 指向本块的第 k-1 帧。步长向上取整，保证输出帧数不超过
//! `floor(n * dst / src) + 1`。

use super::Resampler;

const FRAC_BITS: u32 = 32;
const FRAC_MASK: u64 = (1 << FRAC_BITS) - 1;

pub struct LinearResampler {
    src_rate: u32,
    dst_rate: u32,
    channels: usize,
    /// 每个输出帧前进的输入帧数（32.32）
    step: u64,
    /// 当前位置（32.32）
    pos: u64,
    /// 上一块的最后一帧
    prev: Vec<i32>,
}

impl LinearResampler {
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize) -> Self {
        let step = ((src_rate as u64) << FRAC_BITS).div_ceil(dst_rate.max(1) as u64);
        Self {
            src_rate,
            dst_rate,
            channels,
            step,
            pos: 0,
            prev: vec![0; channels],
        }
    }

    #[inline]
    fn frame<'a>(&'a self, input: &'a [i32], index: usize) -> &'a [i32] {
        if index == 0 {
            &self.prev
        } else {
            let start = (index - 1) * self.channels;
            &input[start..start + self.channels]
        }
    }
}

impl Resampler for LinearResampler {
    fn resample_from_input(&mut self, input: &[i32], output: &mut [i32]) -> (usize, usize) {
        let ch = self.channels;
        let in_frames = input.len() / ch;
        let out_capacity = output.len() / ch;

        let mut produced = 0;
        while produced < out_capacity {
            let index = (self.pos >> FRAC_BITS) as usize;
            // 需要 index 和 index+1 两帧
            if index >= in_frames {
                break;
            }
            // 16 位小数精度足够，并且 (b - a) * frac 不会溢出 i64
            let frac = ((self.pos & FRAC_MASK) >> 16) as i64;
            let a = self.frame(input, index);
            let b = self.frame(input, index + 1);
            let out = &mut output[produced * ch..(produced + 1) * ch];
            for c in 0..ch {
                let a = a[c] as i64;
                let b = b[c] as i64;
                out[c] = (a + (((b - a) * frac) >> 16)) as i32;
            }
            produced += 1;
            self.pos += self.step;
        }

        let consumed = ((self.pos >> FRAC_BITS) as usize).min(in_frames);
        if consumed > 0 {
            let start = (consumed - 1) * ch;
            self.prev.copy_from_slice(&input[start..start + ch]);
            self.pos -= (consumed as u64) << FRAC_BITS;
        }

        (consumed, produced)
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn ratio(&self) -> f64 {
        self.dst_rate as f64 / self.src_rate as f64
    }

    fn latency(&self) -> usize {
        1
    }

    fn reset(&mut self) {
        self.pos = 0;
        self.prev.fill(0);
    }
}
