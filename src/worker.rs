//! Worker 生命周期
//!
//! 每个分块一个 `ChunkWorker`，每个合并中的任务一个 `MergeWorker`。
//! worker 与 Moderator 的契约很窄：拿到取消令牌做协作式中断，通过
//! `WorkerSink` 发出恰好一个终结事件，绝不反向触碰调度状态。

pub(crate) mod chunk;
pub(crate) mod merge;

use crate::moderator::ModeratorJob;
use crate::model::chunk::ChunkId;
use crate::model::task::TaskId;
use tokio::sync::mpsc::UnboundedSender;

/// worker 终结事件的回调入口
///
/// 携带派生时分配的实例号，Moderator 据此识别过期 worker 的事件
#[derive(Clone)]
pub(crate) struct WorkerSink {
    jobs: UnboundedSender<ModeratorJob>,
    instance: u64,
}

impl WorkerSink {
    pub(crate) fn new(jobs: UnboundedSender<ModeratorJob>, instance: u64) -> Self {
        Self { jobs, instance }
    }

    fn send(&self, job: ModeratorJob) {
        // Moderator 已退出时事件自然丢弃
        let _ = self.jobs.send(job);
    }

    pub(crate) fn chunk_finished(&self, task_id: TaskId, chunk_id: ChunkId) {
        self.send(ModeratorJob::ChunkFinished {
            task_id,
            chunk_id,
            instance: self.instance,
        });
    }

    pub(crate) fn chunk_error(&self, task_id: TaskId, chunk_id: ChunkId, reason: String) {
        self.send(ModeratorJob::ChunkError {
            task_id,
            chunk_id,
            instance: self.instance,
            reason,
        });
    }

    pub(crate) fn chunk_interrupted(&self, chunk_id: ChunkId) {
        self.send(ModeratorJob::ChunkInterrupted {
            chunk_id,
            instance: self.instance,
        });
    }

    pub(crate) fn merge_finished(&self, task_id: TaskId) {
        self.send(ModeratorJob::MergeFinished {
            task_id,
            instance: self.instance,
        });
    }

    pub(crate) fn merge_error(&self, task_id: TaskId, reason: String) {
        self.send(ModeratorJob::MergeError {
            task_id,
            instance: self.instance,
            reason,
        });
    }

    pub(crate) fn merge_interrupted(&self, task_id: TaskId) {
        self.send(ModeratorJob::MergeInterrupted {
            task_id,
            instance: self.instance,
        });
    }
}
