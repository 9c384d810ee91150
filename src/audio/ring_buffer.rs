//! Lock-free 单生产者单消费者帧环形缓冲区
//!
//! 用于模拟内核 PCM ring buffer：
//! - 生产者：输出流的写线程（阻塞写入）
//! - 消费者：硬件时钟线程 / 声卡回调（按 period 取走数据）
//!
//! 读写位置以帧为单位，容量不要求是 2 的幂（period_size × period_count
//! 可以是任意值）。

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// SPSC 帧环形缓冲区（交错 i32 样本）
pub struct FrameRing {
    buffer: Box<[UnsafeCell<i32>]>,
    channels: usize,
    capacity_frames: usize,

    // 读写游标各自独占一个 cache line
    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,

    memory_locked: AtomicBool,
}

unsafe impl Send for FrameRing {}
unsafe impl Sync for FrameRing {}

impl FrameRing {
    /// 创建容量为 `capacity_frames` 帧、`channels` 声道的缓冲区
    pub fn new(capacity_frames: usize, channels: usize) -> Self {
        assert!(capacity_frames > 0, "ring capacity must be non-zero");
        assert!(channels > 0, "channel count must be non-zero");

        let buffer: Vec<UnsafeCell<i32>> = (0..capacity_frames * channels)
            .map(|_| UnsafeCell::new(0))
            .collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            channels,
            capacity_frames,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
            memory_locked: AtomicBool::new(false),
        }
    }

    /// 锁定缓冲区内存，防止换页引起的时序抖动
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        let len = std::mem::size_of_val(&*self.buffer);

        let result = unsafe { libc::mlock(ptr, len) };
        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("PCM ring memory locked: {} bytes", len);
            true
        } else {
            log::debug!(
                "Failed to lock PCM ring memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }
        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        let len = std::mem::size_of_val(&*self.buffer);
        unsafe {
            libc::munlock(ptr, len);
        }
    }

    #[inline]
    fn slot(&self, frame_pos: usize) -> usize {
        (frame_pos % self.capacity_frames) * self.channels
    }

    /// 写入完整帧（生产者调用），返回实际写入的帧数
    ///
    /// wait-free，空间不足时只写入能放下的部分
    pub fn write(&self, samples: &[i32]) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);

        let used = write.wrapping_sub(read);
        debug_assert!(used <= self.capacity_frames, "ring invariant violated");

        let free = self.capacity_frames - used;
        let to_write = (samples.len() / self.channels).min(free);

        for (i, frame) in samples.chunks_exact(self.channels).take(to_write).enumerate() {
            let base = self.slot(write.wrapping_add(i));
            for (ch, &sample) in frame.iter().enumerate() {
                unsafe {
                    *self.buffer[base + ch].get() = sample;
                }
            }
        }

        self.write_pos
            .store(write.wrapping_add(to_write), Ordering::Release);
        to_write
    }

    /// 读取完整帧（消费者调用），返回实际读取的帧数
    pub fn read(&self, output: &mut [i32]) -> usize {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);

        let available = write.wrapping_sub(read);
        let to_read = (output.len() / self.channels).min(available);

        for (i, frame) in output
            .chunks_exact_mut(self.channels)
            .take(to_read)
            .enumerate()
        {
            let base = self.slot(read.wrapping_add(i));
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample = unsafe { *self.buffer[base + ch].get() };
            }
        }

        self.read_pos.store(read.wrapping_add(to_read), Ordering::Release);
        to_read
    }

    /// 丢弃全部已排队数据（消费者调用）
    pub fn clear(&self) {
        let write = self.write_pos.load(Ordering::Acquire);
        self.read_pos.store(write, Ordering::Release);
    }

    /// 已排队帧数
    #[inline]
    pub fn queued_frames(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// 可写入帧数
    #[inline]
    pub fn free_frames(&self) -> usize {
        self.capacity_frames - self.queued_frames()
    }

    #[inline]
    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }
}

impl Drop for FrameRing {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}
