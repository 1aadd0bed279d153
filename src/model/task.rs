//! 下载任务模型

use std::path::{Path, PathBuf};

/// 任务 ID 类型
///
/// 由任务存储在插入时分配，全局稳定
pub type TaskId = u64;

/// 任务状态机
///
/// `Idle → Waiting → Merging → Finished`，任何阶段都可能进入 `Failed`。
/// `Finished` 和 `Failed` 是吸收态，一旦进入不再迁移。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// 新插入，尚未探测长度 / 规划分块
    Idle,
    /// 分块已规划，等待或正在下载
    Waiting,
    /// 全部分块完成，正在合并溢写文件
    Merging,
    /// 下载成功（终态）
    Finished,
    /// 下载失败（终态），原因见 `Task::message`
    Failed,
}

impl TaskState {
    /// 是否为吸收态
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Failed)
    }
}

/// 一个下载任务：源 URL + 目标路径 + 分块策略
///
/// 任务在 `FileDownloader::add_task` 时插入任务存储并获得稳定 ID；
/// 之后的全部状态迁移只发生在 Moderator 任务上。
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    url: String,
    save_path: PathBuf,
    /// 文件总长度；`None` 表示未知，初始化时通过 HTTP 探测
    length: Option<u64>,
    /// 服务器是否支持字节范围请求；只有可续传任务才会被分块 / 拆分
    resumable: bool,
    /// 该任务最多被切成多少个分块
    max_chunks: u32,
    /// 该任务同时运行的分块 worker 上限
    max_parallel_connections: usize,
    state: TaskState,
    /// 最近一次状态文本（失败原因 / 成功提示）
    message: String,
}

impl Task {
    /// 创建任务构建器
    pub fn builder(url: impl Into<String>, save_path: impl Into<PathBuf>) -> TaskBuilder {
        TaskBuilder::new(url, save_path)
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[inline]
    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    #[inline]
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    #[inline]
    pub fn is_resumable(&self) -> bool {
        self.resumable
    }

    #[inline]
    pub fn max_chunks(&self) -> u32 {
        self.max_chunks
    }

    #[inline]
    pub fn max_parallel_connections(&self) -> usize {
        self.max_parallel_connections
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.state
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 分配稳定 ID，由任务存储实现在插入时调用
    pub fn assign_id(&mut self, id: TaskId) {
        self.id = id;
    }

    /// 迁移状态，保留 message
    pub(crate) fn with_state(mut self, state: TaskState) -> Self {
        self.state = state;
        self
    }

    /// 迁移状态并更新 message
    pub(crate) fn with_state_message(mut self, state: TaskState, message: impl Into<String>) -> Self {
        self.state = state;
        self.message = message.into();
        self
    }

    /// 记录探测到的文件长度
    pub(crate) fn with_length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }
}

/// 任务构建器
///
/// # Example
///
/// ```
/// # use downpour::Task;
/// let task = Task::builder("http://example.com/file.bin", "/tmp/file.bin")
///     .max_chunks(8)
///     .max_parallel_connections(4)
///     .build();
/// assert!(task.is_resumable());
/// ```
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    url: String,
    save_path: PathBuf,
    length: Option<u64>,
    resumable: bool,
    max_chunks: u32,
    max_parallel_connections: usize,
}

impl TaskBuilder {
    /// 创建新的任务构建器
    ///
    /// 默认：长度未知（初始化时探测）、可续传、最多 8 个分块、
    /// 单任务最多 4 个并行连接
    pub fn new(url: impl Into<String>, save_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            save_path: save_path.into(),
            length: None,
            resumable: true,
            max_chunks: 8,
            max_parallel_connections: 4,
        }
    }

    /// 预先给定文件长度，跳过初始化时的 HTTP 探测
    pub fn length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    /// 设置服务器是否支持字节范围请求
    ///
    /// 不可续传的任务只会有一个覆盖整个文件的分块
    pub fn resumable(mut self, resumable: bool) -> Self {
        self.resumable = resumable;
        self
    }

    /// 设置分块数量上限（必须 ≥ 1）
    pub fn max_chunks(mut self, count: u32) -> Self {
        self.max_chunks = count.max(1);
        self
    }

    /// 设置该任务的并行连接上限（必须 ≥ 1）
    pub fn max_parallel_connections(mut self, count: usize) -> Self {
        self.max_parallel_connections = count.max(1);
        self
    }

    /// 构建任务
    ///
    /// 新任务处于 `Idle` 状态，ID 在插入任务存储时分配
    pub fn build(self) -> Task {
        Task {
            id: 0,
            url: self.url,
            save_path: self.save_path,
            length: self.length,
            resumable: self.resumable,
            max_chunks: self.max_chunks,
            max_parallel_connections: self.max_parallel_connections,
            state: TaskState::Idle,
            message: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let task = Task::builder("http://example.com/a.bin", "/tmp/a.bin").build();
        assert_eq!(task.state(), TaskState::Idle);
        assert_eq!(task.length(), None);
        assert!(task.is_resumable());
        assert_eq!(task.max_chunks(), 8);
        assert_eq!(task.max_parallel_connections(), 4);
        assert_eq!(task.message(), "");
    }

    #[test]
    fn test_builder_floors() {
        let task = Task::builder("http://example.com/a.bin", "/tmp/a.bin")
            .max_chunks(0)
            .max_parallel_connections(0)
            .build();
        assert_eq!(task.max_chunks(), 1);
        assert_eq!(task.max_parallel_connections(), 1);
    }

    #[test]
    fn test_state_transitions() {
        let task = Task::builder("http://example.com/a.bin", "/tmp/a.bin").build();
        let task = task.with_state(TaskState::Waiting);
        assert_eq!(task.state(), TaskState::Waiting);

        let task = task.with_state_message(TaskState::Failed, "Cancelled");
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.message(), "Cancelled");
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Finished.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Idle.is_terminal());
        assert!(!TaskState::Waiting.is_terminal());
        assert!(!TaskState::Merging.is_terminal());
    }
}
