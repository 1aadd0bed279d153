//! # downpour: 并发、可断点续传的多连接下载引擎
//!
//! 基于 tokio 和 channel 的异步多任务下载库
//!
//! ## 特性
//!
//! - 多任务并发下载，全局 worker 预算统一调度
//! - 单文件分块下载（支持 HTTP Range 请求），分块并行写入独立溢写文件
//! - **动态拆分机制**：运行中的分块按剩余字节数从大到小拆分，榨干连接预算
//! - 暂停 / 恢复：分块进度持久化在任务存储中，恢复时从断点续传
//! - 单任务 Moderator 调度循环，全部调度决策串行化，无锁管理 worker 注册表
//! - 聚合下载速度实时测量
//! - 事件监听器分发（任务添加 / 状态变化 / 完成 / 失败）
//! - 使用 `log` crate 进行日志记录
//!
//! ## 示例
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use downpour::io::{ReqwestHttpClient, TokioFileManager};
//! use downpour::manager::{MemoryTaskManager, TaskManager};
//! use downpour::{DownloaderConfig, FileDownloader, Task, TaskState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), downpour::DownloaderError> {
//!     let downloader = FileDownloader::new(
//!         DownloaderConfig::default(),
//!         Arc::new(ReqwestHttpClient::new()),
//!         Arc::new(TokioFileManager::new()),
//!         Arc::new(MemoryTaskManager::new()),
//!     );
//!
//!     let task = downloader.add_task(
//!         Task::builder("https://example.com/large_file.zip", "large_file.zip")
//!             .max_chunks(8)
//!             .max_parallel_connections(4)
//!             .build(),
//!     )?;
//!     downloader.set_max_workers(8);
//!     downloader.start();
//!
//!     // 轮询任务状态直到终结
//!     let tasks = downloader.task_manager().ok_or(downpour::DownloaderError::Released)?;
//!     loop {
//!         match tasks.find_task(task.id()).map(|t| t.state()) {
//!             Some(TaskState::Finished) | Some(TaskState::Failed) | None => break,
//!             _ => tokio::time::sleep(Duration::from_millis(200)).await,
//!         }
//!     }
//!
//!     downloader.release().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod events;
pub mod io;
pub mod manager;
pub mod model;
pub mod speed;

mod moderator;
mod worker;

// 重新导出核心类型
pub use config::{DownloaderConfig, DownloaderConfigBuilder};
pub use events::{EventExecutor, EventListener, InlineExecutor, TokioExecutor};
pub use model::chunk::{Chunk, ChunkId};
pub use model::task::{Task, TaskBuilder, TaskId, TaskState};
pub use moderator::FileDownloader;
pub use speed::SpeedMeter;

/// 下载器公共 API 错误类型
///
/// worker 内部的 HTTP / IO 失败不会出现在这里：它们被转化为任务状态
/// 迁移（任务进入 `Failed` 并携带原因字符串）。
#[derive(thiserror::Error, Debug)]
pub enum DownloaderError {
    /// 指定 ID 的任务不存在
    #[error("任务不存在: task-{0}")]
    TaskNotFound(TaskId),

    /// 下载器已经 release，外部协作者均已释放
    #[error("下载器已释放")]
    Released,
}

/// 下载器结果类型
pub type Result<T> = std::result::Result<T, DownloaderError>;
