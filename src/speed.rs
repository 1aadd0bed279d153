//! 下载速度计
//!
//! 聚合所有分块 worker 上报的字节数，在滑动窗口内计算瞬时吞吐。
//! 可暂停：暂停时丢弃窗口内的采样并停止接收新采样，读数归零。

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 滑动窗口速度计
///
/// 多个 worker 并发上报字节数是安全的；窗口外的采样在上报和读数时
/// 惰性淘汰。
pub struct SpeedMeter {
    window: Duration,
    inner: Mutex<MeterState>,
}

struct MeterState {
    paused: bool,
    /// (采样时刻, 字节数)
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    /// 创建速度计
    ///
    /// # Arguments
    ///
    /// * `window` - 滑动窗口宽度
    ///
    /// 新建的速度计处于暂停状态，随 `FileDownloader::start` 启动
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(MeterState {
                paused: true,
                samples: VecDeque::new(),
            }),
        }
    }

    /// 恢复计量
    pub fn start(&self) {
        self.inner.lock().paused = false;
    }

    /// 暂停计量并清空窗口，读数立即归零
    pub fn pause(&self) {
        let mut state = self.inner.lock();
        state.paused = true;
        state.samples.clear();
    }

    /// worker 上报下载的字节数
    pub fn record(&self, bytes: u64) {
        let now = Instant::now();
        let mut state = self.inner.lock();
        if state.paused {
            return;
        }
        Self::evict(&mut state.samples, now, self.window);
        state.samples.push_back((now, bytes));
    }

    /// 当前吞吐（bytes/s）
    pub fn speed(&self) -> u64 {
        let now = Instant::now();
        let mut state = self.inner.lock();
        if state.paused {
            return 0;
        }
        Self::evict(&mut state.samples, now, self.window);
        let total: u64 = state.samples.iter().map(|(_, bytes)| bytes).sum();
        (total as f64 / self.window.as_secs_f64()) as u64
    }

    fn evict(samples: &mut VecDeque<(Instant, u64)>, now: Instant, window: Duration) {
        while let Some((stamp, _)) = samples.front() {
            if now.duration_since(*stamp) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}
