//! rubato 封装
//!
//! `FastFixedIn` 要求固定大小的平面输入块，这里做两件事：
//! 把任意长度的交错输入攒成块，把输出缓存在队列里按调用方容量取走。

use std::collections::VecDeque;

use rubato::{FastFixedIn, PolynomialDegree, Resampler as _};

use super::{ResampleError, Resampler};

/// i32 满幅
const I32_FULL_SCALE: f64 = 2_147_483_648.0;

pub struct RubatoResampler {
    inner: FastFixedIn<f64>,
    src_rate: u32,
    dst_rate: u32,
    channels: usize,
    /// 尚未凑够一块的输入（平面格式）
    pending: Vec<Vec<f64>>,
    /// 已产生、尚未交给调用方的输出（交错格式）
    ready: VecDeque<i32>,
}

impl RubatoResampler {
    pub fn new(
        src_rate: u32,
        dst_rate: u32,
        channels: usize,
        chunk_frames: usize,
    ) -> Result<Self, ResampleError> {
        let inner = FastFixedIn::<f64>::new(
            dst_rate as f64 / src_rate as f64,
            1.0,
            PolynomialDegree::Septic,
            chunk_frames,
            channels,
        )
        .map_err(|e| ResampleError::Backend(e.to_string()))?;

        Ok(Self {
            inner,
            src_rate,
            dst_rate,
            channels,
            pending: vec![Vec::with_capacity(chunk_frames); channels],
            ready: VecDeque::new(),
        })
    }

    /// 排队中的输出帧数
    pub fn buffered_frames(&self) -> usize {
        self.ready.len() / self.channels
    }

    fn process_pending(&mut self) {
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending[0].len() < needed {
                return;
            }

            let chunk: Vec<&[f64]> = self.pending.iter().map(|ch| &ch[..needed]).collect();
            let planar = match self.inner.process(&chunk, None) {
                Ok(out) => out,
                Err(e) => {
                    // 丢掉这一块，避免卡死在同一块输入上
                    log::warn!("Resampler dropped a chunk: {}", e);
                    for ch in &mut self.pending {
                        ch.drain(..needed);
                    }
                    continue;
                }
            };

            for ch in &mut self.pending {
                ch.drain(..needed);
            }

            let frames = planar.first().map_or(0, |ch| ch.len());
            for i in 0..frames {
                for ch in &planar {
                    let v = (ch[i] * I32_FULL_SCALE).clamp(i32::MIN as f64, i32::MAX as f64);
                    self.ready.push_back(v as i32);
                }
            }
        }
    }
}

impl Resampler for RubatoResampler {
    fn resample_from_input(&mut self, input: &[i32], output: &mut [i32]) -> (usize, usize) {
        let ch = self.channels;
        let in_frames = input.len() / ch;

        for frame in input.chunks_exact(ch) {
            for (c, &sample) in frame.iter().enumerate() {
                self.pending[c].push(sample as f64 / I32_FULL_SCALE);
            }
        }
        self.process_pending();

        let out_frames = (output.len() / ch).min(self.buffered_frames());
        for (dst, src) in output[..out_frames * ch].iter_mut().zip(self.ready.drain(..out_frames * ch)) {
            *dst = src;
        }

        (in_frames, out_frames)
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn ratio(&self) -> f64 {
        self.dst_rate as f64 / self.src_rate as f64
    }

    fn latency(&self) -> usize {
        self.inner.output_delay() + self.buffered_frames()
    }

    fn reset(&mut self) {
        self.inner.reset();
        for ch in &mut self.pending {
            ch.clear();
        }
        self.ready.clear();
    }
}
