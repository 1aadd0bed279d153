//! 任务存储抽象层
//!
//! `TaskManager` 是核心消费的持久化契约：任务与分块记录的增删改查。
//! 实现必须自带并发安全——Moderator 任务和各分块 worker 会同时访问，
//! 其中 worker 只更新自己分块的进度计数。
//!
//! crate 内置非持久化的 `MemoryTaskManager`；需要落库的使用方可以
//! 自行实现本 trait。

use crate::model::chunk::{Chunk, ChunkId};
use crate::model::task::{Task, TaskId};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// 任务与分块记录的存储契约
pub trait TaskManager: Send + Sync + 'static {
    /// 插入任务并分配稳定 ID，返回入库后的任务
    fn insert_task(&self, task: Task) -> Task;

    /// 按 ID 查找任务
    fn find_task(&self, id: TaskId) -> Option<Task>;

    /// 覆盖写入任务（按 ID），返回入库后的任务
    fn update_task(&self, task: Task) -> Task;

    /// 按插入顺序返回所有未终结（非 Finished / Failed）的任务
    fn undone_tasks(&self) -> Vec<Task>;

    /// 插入分块并分配稳定 ID，返回入库后的分块
    fn insert_chunk(&self, chunk: Chunk) -> Chunk;

    /// 按插入顺序返回任务的全部分块
    fn chunks_of_task(&self, task_id: TaskId) -> Vec<Chunk>;

    /// 删除任务的全部分块记录
    fn remove_chunks_of_task(&self, task_id: TaskId);

    /// 累加分块的已下载字节数（分块 worker 专用），返回更新后的分块
    fn add_chunk_downloaded(&self, chunk_id: ChunkId, bytes: u64) -> Option<Chunk>;

    /// 收窄分块区间终点（Moderator 拆分时专用）
    fn set_chunk_end(&self, chunk_id: ChunkId, end: u64);

    /// 将整文件分块标记为完成（worker 在 EOF 时调用）
    fn mark_chunk_finished(&self, chunk_id: ChunkId);

    /// 释放存储资源；之后的查询返回空
    fn release(&self);
}

/// 非持久化的内存任务存储
///
/// 用单把锁保护全部记录，`BTreeMap` 保证按 ID（即插入顺序）遍历。
/// 进程退出后记录即丢失，适合临时下载和测试场景。
pub struct MemoryTaskManager {
    inner: Mutex<MemoryStore>,
}

struct MemoryStore {
    next_task_id: TaskId,
    next_chunk_id: ChunkId,
    tasks: BTreeMap<TaskId, Task>,
    chunks: BTreeMap<ChunkId, Chunk>,
}

impl MemoryTaskManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryStore {
                next_task_id: 1,
                next_chunk_id: 1,
                tasks: BTreeMap::new(),
                chunks: BTreeMap::new(),
            }),
        }
    }
}

impl Default for MemoryTaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager for MemoryTaskManager {
    fn insert_task(&self, mut task: Task) -> Task {
        let mut store = self.inner.lock();
        let id = store.next_task_id;
        store.next_task_id += 1;
        task.assign_id(id);
        store.tasks.insert(id, task.clone());
        task
    }

    fn find_task(&self, id: TaskId) -> Option<Task> {
        self.inner.lock().tasks.get(&id).cloned()
    }

    fn update_task(&self, task: Task) -> Task {
        let mut store = self.inner.lock();
        store.tasks.insert(task.id(), task.clone());
        task
    }

    fn undone_tasks(&self) -> Vec<Task> {
        self.inner
            .lock()
            .tasks
            .values()
            .filter(|t| !t.state().is_terminal())
            .cloned()
            .collect()
    }

    fn insert_chunk(&self, mut chunk: Chunk) -> Chunk {
        let mut store = self.inner.lock();
        let id = store.next_chunk_id;
        store.next_chunk_id += 1;
        chunk.assign_id(id);
        store.chunks.insert(id, chunk.clone());
        chunk
    }

    fn chunks_of_task(&self, task_id: TaskId) -> Vec<Chunk> {
        self.inner
            .lock()
            .chunks
            .values()
            .filter(|c| c.task_id() == task_id)
            .cloned()
            .collect()
    }

    fn remove_chunks_of_task(&self, task_id: TaskId) {
        self.inner
            .lock()
            .chunks
            .retain(|_, c| c.task_id() != task_id);
    }

    fn add_chunk_downloaded(&self, chunk_id: ChunkId, bytes: u64) -> Option<Chunk> {
        let mut store = self.inner.lock();
        let chunk = store.chunks.get_mut(&chunk_id)?;
        chunk.add_downloaded(bytes);
        Some(chunk.clone())
    }

    fn set_chunk_end(&self, chunk_id: ChunkId, end: u64) {
        if let Some(chunk) = self.inner.lock().chunks.get_mut(&chunk_id) {
            chunk.set_end(end);
        }
    }

    fn mark_chunk_finished(&self, chunk_id: ChunkId) {
        if let Some(chunk) = self.inner.lock().chunks.get_mut(&chunk_id) {
            chunk.mark_finished();
        }
    }

    fn release(&self) {
        let mut store = self.inner.lock();
        store.tasks.clear();
        store.chunks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task::TaskState;

    fn sample_task(name: &str) -> Task {
        Task::builder(format!("http://example.com/{name}"), format!("/tmp/{name}")).build()
    }

    #[test]
    fn test_insert_assigns_stable_ids() {
        let manager = MemoryTaskManager::new();
        let a = manager.insert_task(sample_task("a.bin"));
        let b = manager.insert_task(sample_task("b.bin"));
        assert_ne!(a.id(), 0);
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.find_task(a.id()).unwrap().url(), a.url());
    }

    #[test]
    fn test_undone_tasks_skips_terminal() {
        let manager = MemoryTaskManager::new();
        let a = manager.insert_task(sample_task("a.bin"));
        let b = manager.insert_task(sample_task("b.bin"));
        manager.update_task(a.with_state_message(TaskState::Failed, "boom"));

        let undone = manager.undone_tasks();
        assert_eq!(undone.len(), 1);
        assert_eq!(undone[0].id(), b.id());
    }

    #[test]
    fn test_undone_tasks_insertion_order() {
        let manager = MemoryTaskManager::new();
        let ids: Vec<_> = (0..5)
            .map(|i| manager.insert_task(sample_task(&format!("{i}.bin"))).id())
            .collect();
        let undone: Vec<_> = manager.undone_tasks().iter().map(|t| t.id()).collect();
        assert_eq!(undone, ids);
    }

    #[test]
    fn test_chunk_lifecycle() {
        let manager = MemoryTaskManager::new();
        let task = manager.insert_task(sample_task("a.bin"));
        let c1 = manager.insert_chunk(Chunk::new(task.id(), Some((0, 499))));
        let c2 = manager.insert_chunk(Chunk::new(task.id(), Some((500, 999))));

        assert_eq!(manager.chunks_of_task(task.id()).len(), 2);

        let updated = manager.add_chunk_downloaded(c1.id(), 500).unwrap();
        assert!(updated.is_finished());

        manager.set_chunk_end(c2.id(), 749);
        let chunks = manager.chunks_of_task(task.id());
        assert_eq!(chunks[1].range(), Some((500, 749)));

        manager.remove_chunks_of_task(task.id());
        assert!(manager.chunks_of_task(task.id()).is_empty());
    }

    #[test]
    fn test_release_clears_records() {
        let manager = MemoryTaskManager::new();
        let task = manager.insert_task(sample_task("a.bin"));
        manager.insert_chunk(Chunk::new(task.id(), None));
        manager.release();
        assert!(manager.find_task(task.id()).is_none());
        assert!(manager.undone_tasks().is_empty());
    }
}
