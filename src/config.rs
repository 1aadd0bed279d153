//! 下载器配置模块
//!
//! 提供调度引擎的配置选项，包括分块下限、全局 worker 预算和测速窗口

use std::time::Duration;

/// 默认最小分块长度：1 MiB
///
/// 任务初始化与运行中拆分都不会产生比这更小的分块
pub const DEFAULT_MIN_CHUNK_LENGTH: u64 = 1024 * 1024;

/// 默认全局 worker 预算
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// 默认测速窗口
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(3);

/// 下载器配置
///
/// 控制 Moderator 的分块策略、初始 worker 预算和速度计的滑动窗口。
/// worker 预算在运行期间可以通过 `FileDownloader::set_max_workers` 调整，
/// 这里只是初始值。
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// 最小分块长度（bytes）
    ///
    /// 初始化时按此值决定分块数量；运行中剩余字节不足
    /// `2 * min_chunk_length` 的分块不再拆分
    pub(crate) min_chunk_length: u64,

    /// 初始全局 worker 预算（分块 worker 与合并 worker 共用）
    pub(crate) max_workers: usize,

    /// 速度计滑动窗口
    pub(crate) speed_window: Duration,
}

impl DownloaderConfig {
    /// 创建配置构建器
    ///
    /// # Example
    ///
    /// ```
    /// # use downpour::DownloaderConfig;
    /// let config = DownloaderConfig::builder()
    ///     .min_chunk_length(2 * 1024 * 1024)
    ///     .max_workers(8)
    ///     .build();
    /// ```
    pub fn builder() -> DownloaderConfigBuilder {
        DownloaderConfigBuilder::new()
    }

    /// 获取最小分块长度
    pub fn min_chunk_length(&self) -> u64 {
        self.min_chunk_length
    }

    /// 获取初始全局 worker 预算
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// 获取测速窗口
    pub fn speed_window(&self) -> Duration {
        self.speed_window
    }
}

impl Default for DownloaderConfig {
    /// 创建默认配置
    ///
    /// - 最小分块: 1 MiB
    /// - worker 预算: 4
    /// - 测速窗口: 3 s
    fn default() -> Self {
        Self {
            min_chunk_length: DEFAULT_MIN_CHUNK_LENGTH,
            max_workers: DEFAULT_MAX_WORKERS,
            speed_window: DEFAULT_SPEED_WINDOW,
        }
    }
}

/// 下载器配置构建器
///
/// 使用 Builder 模式创建 `DownloaderConfig`
#[derive(Debug, Clone)]
pub struct DownloaderConfigBuilder {
    min_chunk_length: u64,
    max_workers: usize,
    speed_window: Duration,
}

impl DownloaderConfigBuilder {
    /// 创建新的配置构建器（使用默认值）
    pub fn new() -> Self {
        Self {
            min_chunk_length: DEFAULT_MIN_CHUNK_LENGTH,
            max_workers: DEFAULT_MAX_WORKERS,
            speed_window: DEFAULT_SPEED_WINDOW,
        }
    }

    /// 设置最小分块长度（必须 > 0）
    pub fn min_chunk_length(mut self, length: u64) -> Self {
        self.min_chunk_length = length.max(1);
        self
    }

    /// 设置初始全局 worker 预算
    ///
    /// 允许为 0：此时任何任务都不会被调度，直到调用
    /// `FileDownloader::set_max_workers` 提高预算
    pub fn max_workers(mut self, count: usize) -> Self {
        self.max_workers = count;
        self
    }

    /// 设置测速窗口
    pub fn speed_window(mut self, window: Duration) -> Self {
        self.speed_window = window;
        self
    }

    /// 构建配置
    pub fn build(self) -> DownloaderConfig {
        DownloaderConfig {
            min_chunk_length: self.min_chunk_length,
            max_workers: self.max_workers,
            speed_window: self.speed_window,
        }
    }
}

impl Default for DownloaderConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DownloaderConfig::default();
        assert_eq!(config.min_chunk_length(), DEFAULT_MIN_CHUNK_LENGTH);
        assert_eq!(config.max_workers(), DEFAULT_MAX_WORKERS);
        assert_eq!(config.speed_window(), DEFAULT_SPEED_WINDOW);
    }

    #[test]
    fn test_builder_custom() {
        let config = DownloaderConfig::builder()
            .min_chunk_length(512 * 1024)
            .max_workers(16)
            .speed_window(Duration::from_secs(1))
            .build();
        assert_eq!(config.min_chunk_length(), 512 * 1024);
        assert_eq!(config.max_workers(), 16);
        assert_eq!(config.speed_window(), Duration::from_secs(1));
    }

    #[test]
    fn test_builder_zero_workers_allowed() {
        // 预算为 0 是合法配置，任务会停在 Waiting
        let config = DownloaderConfig::builder().max_workers(0).build();
        assert_eq!(config.max_workers(), 0);
    }

    #[test]
    fn test_builder_min_chunk_length_floor() {
        // 分块下限至少为 1
        let config = DownloaderConfig::builder().min_chunk_length(0).build();
        assert_eq!(config.min_chunk_length(), 1);
    }
}
