//! 合并 worker
//!
//! 把一个任务的全部溢写文件按分块的起始偏移顺序拼接成目标文件。
//! Moderator 保证启动合并时所有分块都已完成、溢写文件尺寸齐全，
//! 合并本身不再校验。

use crate::io::fs::FileManager;
use crate::model::task::Task;
use crate::worker::WorkerSink;
use log::{debug, error};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 合并 worker
///
/// 一生恰好发出一个终结事件：完成 / 错误 / 被中断
pub(crate) struct MergeWorker {
    task: Task,
    /// 按分块起始偏移排好序的溢写文件路径
    sources: Vec<PathBuf>,
    files: Arc<dyn FileManager>,
    token: CancellationToken,
    sink: WorkerSink,
}

impl MergeWorker {
    pub(crate) fn new(
        task: Task,
        sources: Vec<PathBuf>,
        files: Arc<dyn FileManager>,
        token: CancellationToken,
        sink: WorkerSink,
    ) -> Self {
        Self {
            task,
            sources,
            files,
            token,
            sink,
        }
    }

    pub(crate) async fn run(self) {
        let task_id = self.task.id();
        let dest = self.task.save_path().to_path_buf();
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                debug!("task-{} 合并被中断", task_id);
                self.sink.merge_interrupted(task_id);
            }
            result = self.files.concatenate(&dest, &self.sources) => match result {
                Ok(()) => {
                    debug!("task-{} 合并完成: {}", task_id, dest.display());
                    self.sink.merge_finished(task_id);
                }
                Err(e) => {
                    let reason = format!("{e:#}");
                    error!("task-{} 合并失败: {}", task_id, reason);
                    self.sink.merge_error(task_id, reason);
                }
            }
        }
    }
}
