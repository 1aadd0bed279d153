//! Moderator：唯一的调度者
//!
//! 全部调度决策（任务初始化、分块规划、worker 派生、运行中拆分、
//! 取消清理）都在一个专职的 tokio 任务里串行执行。公共 API 把操作
//! 封装成 `ModeratorJob` 投递到 FIFO 队列；worker 的终结事件走同一条
//! 队列。调度状态（worker 注册表、Idle 之后的任务状态迁移）只在这个
//! 任务里被改动，因此不需要任何锁。
//!
//! 调用方一侧只有一把小锁，保护 `running` / `max_workers` / `released`
//! 三个标志以及"改标志 + 投递调度作业"的联合可见性。

use crate::config::DownloaderConfig;
use crate::events::{EventDispatcher, EventExecutor, EventListener};
use crate::io::fs::FileManager;
use crate::io::http::HttpClient;
use crate::manager::TaskManager;
use crate::model::chunk::{Chunk, ChunkId};
use crate::model::task::{Task, TaskId, TaskState};
use crate::speed::SpeedMeter;
use crate::worker::chunk::{ChunkSpan, ChunkWorker};
use crate::worker::merge::MergeWorker;
use crate::worker::WorkerSink;
use crate::DownloaderError;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Moderator 专职任务的名字，用于日志
pub(crate) const MODERATOR_TASK_NAME: &str = "moderator";

/// 投递给 Moderator 任务的作业
///
/// worker 终结事件都带着派生时分配的实例号：暂停后立即恢复时，旧
/// worker 的事件可能排在新 worker 注册之后才到达，实例号保证它们
/// 不会误删新 worker 的注册表条目。
pub(crate) enum ModeratorJob {
    /// 遍历未终结任务：初始化、派生 worker、拆分
    SpawnPass,
    /// 中断注册表里的全部 worker 并等待退出（暂停 / 释放）
    InterruptAll,
    /// 取消清理：中断任务的 worker、删除溢写文件和分块记录
    Cleanup { task_id: TaskId },
    /// 分块下载完成
    ChunkFinished {
        task_id: TaskId,
        chunk_id: ChunkId,
        instance: u64,
    },
    /// 分块下载失败，整个任务随之失败
    ChunkError {
        task_id: TaskId,
        chunk_id: ChunkId,
        instance: u64,
        reason: String,
    },
    /// 分块 worker 被协作式中断
    ChunkInterrupted { chunk_id: ChunkId, instance: u64 },
    /// 合并完成
    MergeFinished { task_id: TaskId, instance: u64 },
    /// 合并失败
    MergeError {
        task_id: TaskId,
        instance: u64,
        reason: String,
    },
    /// 合并 worker 被协作式中断
    MergeInterrupted { task_id: TaskId, instance: u64 },
    /// 终结 Moderator：此前投递的作业已全部执行完毕
    Release { ack: oneshot::Sender<()> },
}

/// worker 注册表的键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WorkerKey {
    Chunk(ChunkId),
    Merge(TaskId),
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKey::Chunk(id) => write!(f, "chunk:{}", id),
            WorkerKey::Merge(id) => write!(f, "merge:{}", id),
        }
    }
}

/// 注册表里的 worker 句柄：取消令牌 + join 句柄
struct WorkerHandle {
    task_id: TaskId,
    /// 派生时分配的实例号，终结事件按它验明正身
    instance: u64,
    /// 分块 worker 才有，拆分时使用
    span: Option<Arc<ChunkSpan>>,
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// 调用方一侧的控制标志
struct Control {
    running: bool,
    max_workers: usize,
    released: bool,
}

struct ControlState {
    inner: Mutex<Control>,
}

impl ControlState {
    fn new(max_workers: usize) -> Self {
        Self {
            inner: Mutex::new(Control {
                running: false,
                max_workers,
                released: false,
            }),
        }
    }

    fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    fn max_workers(&self) -> usize {
        self.inner.lock().max_workers
    }

    fn is_released(&self) -> bool {
        self.inner.lock().released
    }
}

struct Collaborators {
    http: Arc<dyn HttpClient>,
    files: Arc<dyn FileManager>,
    tasks: Arc<dyn TaskManager>,
}

/// 下载器门面
///
/// 持有外部协作者（HTTP 客户端、文件管理器、任务存储）并在内部派生
/// Moderator 调度任务。所有方法都可以从任意线程调用。
///
/// 必须在 tokio 运行时内创建。
pub struct FileDownloader {
    control: Arc<ControlState>,
    jobs: UnboundedSender<ModeratorJob>,
    speed: Arc<SpeedMeter>,
    dispatcher: Arc<EventDispatcher>,
    collaborators: Mutex<Option<Collaborators>>,
}

impl FileDownloader {
    /// 创建下载器并启动 Moderator 任务
    ///
    /// 新建的下载器处于暂停状态，调用 [`start`](Self::start) 后才开始调度
    pub fn new(
        config: DownloaderConfig,
        http: Arc<dyn HttpClient>,
        files: Arc<dyn FileManager>,
        tasks: Arc<dyn TaskManager>,
    ) -> Self {
        let control = Arc::new(ControlState::new(config.max_workers()));
        let speed = Arc::new(SpeedMeter::new(config.speed_window()));
        let dispatcher = Arc::new(EventDispatcher::new());
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();

        let moderator = Moderator {
            control: Arc::clone(&control),
            http: Arc::clone(&http),
            files: Arc::clone(&files),
            tasks: Arc::clone(&tasks),
            speed: Arc::clone(&speed),
            dispatcher: Arc::clone(&dispatcher),
            min_chunk_length: config.min_chunk_length(),
            sink: jobs_tx.clone(),
            registry: HashMap::new(),
            next_instance: 0,
        };
        tokio::spawn(moderator.run(jobs_rx));

        Self {
            control,
            jobs: jobs_tx,
            speed,
            dispatcher,
            collaborators: Mutex::new(Some(Collaborators { http, files, tasks })),
        }
    }

    /// 添加下载任务
    ///
    /// 同步插入任务存储并返回带稳定 ID 的任务；下载器正在运行时
    /// 顺带触发一轮调度
    pub fn add_task(&self, task: Task) -> crate::Result<Task> {
        let tasks = self.task_manager().ok_or(DownloaderError::Released)?;
        let stored = tasks.insert_task(task);
        info!("task-{} 已添加: {}", stored.id(), stored.url());
        self.dispatcher.task_added(&stored);
        if self.control.is_running() {
            let _ = self.jobs.send(ModeratorJob::SpawnPass);
        }
        Ok(stored)
    }

    /// 取消任务
    ///
    /// 返回时任务已处于 `Failed`（原因 "Cancelled"）；worker 中断和
    /// 溢写文件删除由随后的异步清理作业完成。对已终结的任务是空操作。
    ///
    /// # Errors
    ///
    /// 任务不存在时返回 [`DownloaderError::TaskNotFound`]
    pub fn cancel_task(&self, id: TaskId) -> crate::Result<()> {
        let tasks = self.task_manager().ok_or(DownloaderError::Released)?;
        let task = tasks
            .find_task(id)
            .ok_or(DownloaderError::TaskNotFound(id))?;
        if task.state().is_terminal() {
            return Ok(());
        }
        let failed = tasks.update_task(task.with_state_message(TaskState::Failed, "Cancelled"));
        info!("task-{} 已取消", id);
        self.dispatcher.task_failed(&failed);
        let _ = self.jobs.send(ModeratorJob::Cleanup { task_id: id });
        Ok(())
    }

    /// 开始 / 恢复调度
    pub fn start(&self) {
        let mut control = self.control.inner.lock();
        if control.released {
            return;
        }
        control.running = true;
        self.speed.start();
        let _ = self.jobs.send(ModeratorJob::SpawnPass);
    }

    /// 暂停调度
    ///
    /// 返回后不会再有新 worker 启动；已投递的中断作业会把注册表里的
    /// 全部 worker 协作式中断。分块进度保留在任务存储里，`start`
    /// 之后从断点续传。
    pub fn pause(&self) {
        let mut control = self.control.inner.lock();
        if control.released {
            return;
        }
        control.running = false;
        self.speed.pause();
        let _ = self.jobs.send(ModeratorJob::InterruptAll);
    }

    /// 释放下载器（终结操作）
    ///
    /// 暂停调度、等待此前投递的作业全部执行完、释放任务存储并丢弃
    /// 外部协作者。之后协作者 getter 返回 `None`，写操作返回
    /// [`DownloaderError::Released`]。重复调用是空操作。
    pub async fn release(&self) {
        {
            let mut control = self.control.inner.lock();
            if control.released {
                return;
            }
            control.released = true;
            control.running = false;
        }
        self.speed.pause();
        let _ = self.jobs.send(ModeratorJob::InterruptAll);
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self.jobs.send(ModeratorJob::Release { ack: ack_tx });
        let _ = ack_rx.await;
        self.dispatcher.clear();
        *self.collaborators.lock() = None;
        info!("下载器已释放");
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    pub fn is_released(&self) -> bool {
        self.control.is_released()
    }

    pub fn get_max_workers(&self) -> usize {
        self.control.max_workers()
    }

    /// 调整全局 worker 预算
    ///
    /// 允许为 0：现有 worker 跑完即止，不再派生新 worker。
    /// 正在运行时顺带触发一轮调度。
    pub fn set_max_workers(&self, count: usize) {
        let mut control = self.control.inner.lock();
        if control.released {
            return;
        }
        control.max_workers = count;
        if control.running {
            let _ = self.jobs.send(ModeratorJob::SpawnPass);
        }
    }

    /// 注册事件监听器，事件作业投递到给定执行器运行
    pub fn register_listener(
        &self,
        listener: Arc<dyn EventListener>,
        executor: Arc<dyn EventExecutor>,
    ) {
        self.dispatcher.register(listener, executor);
    }

    /// 注销监听器（按指针身份匹配）
    pub fn unregister_listener(&self, listener: &Arc<dyn EventListener>) {
        self.dispatcher.unregister(listener);
    }

    /// 注销全部监听器
    pub fn clear_all_listeners(&self) {
        self.dispatcher.clear();
    }

    /// 当前聚合下载速度（bytes/s）
    pub fn get_speed(&self) -> u64 {
        self.speed.speed()
    }

    /// 任务存储；释放后返回 `None`
    pub fn task_manager(&self) -> Option<Arc<dyn TaskManager>> {
        self.collaborators
            .lock()
            .as_ref()
            .map(|c| Arc::clone(&c.tasks))
    }

    /// HTTP 客户端；释放后返回 `None`
    pub fn http_client(&self) -> Option<Arc<dyn HttpClient>> {
        self.collaborators
            .lock()
            .as_ref()
            .map(|c| Arc::clone(&c.http))
    }

    /// 文件管理器；释放后返回 `None`
    pub fn file_manager(&self) -> Option<Arc<dyn FileManager>> {
        self.collaborators
            .lock()
            .as_ref()
            .map(|c| Arc::clone(&c.files))
    }
}

/// Moderator 调度循环
///
/// 只有这个任务消费作业队列，因此注册表和任务状态迁移天然串行
struct Moderator {
    control: Arc<ControlState>,
    http: Arc<dyn HttpClient>,
    files: Arc<dyn FileManager>,
    tasks: Arc<dyn TaskManager>,
    speed: Arc<SpeedMeter>,
    dispatcher: Arc<EventDispatcher>,
    min_chunk_length: u64,
    /// 交给 worker 的事件入口
    sink: UnboundedSender<ModeratorJob>,
    registry: HashMap<WorkerKey, WorkerHandle>,
    /// 单调递增的 worker 实例号
    next_instance: u64,
}

impl Moderator {
    async fn run(mut self, mut jobs: UnboundedReceiver<ModeratorJob>) {
        debug!("{} 任务启动", MODERATOR_TASK_NAME);
        while let Some(job) = jobs.recv().await {
            match job {
                ModeratorJob::SpawnPass => self.spawn_pass().await,
                ModeratorJob::InterruptAll => self.interrupt_all().await,
                ModeratorJob::Cleanup { task_id } => self.cleanup_task(task_id).await,
                ModeratorJob::ChunkFinished {
                    task_id,
                    chunk_id,
                    instance,
                } => {
                    debug!("chunk-{} 完成，移出注册表 (task-{})", chunk_id, task_id);
                    self.remove_if_current(WorkerKey::Chunk(chunk_id), instance);
                    if self.is_running() {
                        self.spawn_pass().await;
                    }
                }
                ModeratorJob::ChunkError {
                    task_id,
                    chunk_id,
                    instance,
                    reason,
                } => {
                    error!("chunk-{} 失败: {} (task-{})", chunk_id, reason, task_id);
                    self.remove_if_current(WorkerKey::Chunk(chunk_id), instance);
                    // 分块失败 ⇒ 整个任务失败，连带取消其余分块
                    self.fail_task(task_id, &reason);
                    self.cleanup_task(task_id).await;
                    if self.is_running() {
                        self.spawn_pass().await;
                    }
                }
                ModeratorJob::ChunkInterrupted { chunk_id, instance } => {
                    debug!("chunk-{} 被中断", chunk_id);
                    self.remove_if_current(WorkerKey::Chunk(chunk_id), instance);
                }
                ModeratorJob::MergeFinished { task_id, instance } => {
                    self.remove_if_current(WorkerKey::Merge(task_id), instance);
                    self.finish_task(task_id).await;
                    if self.is_running() {
                        self.spawn_pass().await;
                    }
                }
                ModeratorJob::MergeError {
                    task_id,
                    instance,
                    reason,
                } => {
                    error!("task-{} 合并失败: {}", task_id, reason);
                    self.remove_if_current(WorkerKey::Merge(task_id), instance);
                    self.fail_task(task_id, &reason);
                    self.cleanup_task(task_id).await;
                    if self.is_running() {
                        self.spawn_pass().await;
                    }
                }
                ModeratorJob::MergeInterrupted { task_id, instance } => {
                    debug!("task-{} 合并被中断", task_id);
                    self.remove_if_current(WorkerKey::Merge(task_id), instance);
                }
                ModeratorJob::Release { ack } => {
                    self.interrupt_all().await;
                    self.tasks.release();
                    let _ = ack.send(());
                    break;
                }
            }
        }
        debug!("{} 任务退出", MODERATOR_TASK_NAME);
    }

    fn is_running(&self) -> bool {
        self.control.is_running()
    }

    fn max_workers(&self) -> usize {
        self.control.max_workers()
    }

    /// 一轮调度：遍历未终结任务，初始化、派生 worker、拆分
    ///
    /// 未在运行时整体空转；注册表按键去重保证重入幂等
    async fn spawn_pass(&mut self) {
        if !self.is_running() {
            return;
        }
        for task in self.tasks.undone_tasks() {
            if !self.is_running() {
                return;
            }
            let task = if task.state() == TaskState::Idle {
                match self.init_task(&task).await {
                    Ok(ready) => ready,
                    Err(e) => {
                        let reason = format!("Failed to read content length: {e:#}");
                        error!("task-{} 初始化失败: {}", task.id(), reason);
                        self.fail_task(task.id(), &reason);
                        continue;
                    }
                }
            } else {
                task
            };

            if self.registry.len() < self.max_workers() {
                let chunks = self.tasks.chunks_of_task(task.id());
                if chunks.iter().all(|c| c.is_finished()) {
                    let merging = if task.state() == TaskState::Merging {
                        task
                    } else {
                        let t = self.tasks.update_task(task.with_state(TaskState::Merging));
                        self.dispatcher.task_updated(&t);
                        t
                    };
                    self.spawn_merge_worker(&merging, &chunks);
                } else {
                    self.spawn_chunk_workers(&task, &chunks);
                    self.split_large_chunks(&task);
                }
            }
        }
    }

    /// 任务初始化：探测长度、规划分块、Idle → Waiting
    async fn init_task(&mut self, task: &Task) -> anyhow::Result<Task> {
        debug!("初始化 task-{}...", task.id());
        // 清掉可能残留的旧分块记录
        self.tasks.remove_chunks_of_task(task.id());

        let mut task = task.clone();
        let length = match task.length() {
            Some(length) => length,
            None => {
                let length = self.http.fetch_content_length(&task).await?;
                task = task.with_length(length);
                length
            }
        };

        if !task.is_resumable() || length == 0 {
            // 只会有一个 worker 服务这个"整文件"分块
            self.tasks.insert_chunk(Chunk::new(task.id(), None));
        } else {
            let mut count: u64 = 1;
            while count < u64::from(task.max_chunks())
                && length / (count + 1) > self.min_chunk_length
            {
                count += 1;
            }
            let per_chunk = length / count;
            for i in 0..count - 1 {
                self.tasks.insert_chunk(Chunk::new(
                    task.id(),
                    Some((i * per_chunk, (i + 1) * per_chunk - 1)),
                ));
            }
            self.tasks.insert_chunk(Chunk::new(
                task.id(),
                Some(((count - 1) * per_chunk, length - 1)),
            ));
            debug!("task-{} 规划为 {} 个分块，共 {} 字节", task.id(), count, length);
        }

        let ready = self.tasks.update_task(task.with_state(TaskState::Waiting));
        self.dispatcher.task_updated(&ready);
        Ok(ready)
    }

    /// 为任务的未完成分块补齐 worker，直到全局预算耗尽
    fn spawn_chunk_workers(&mut self, task: &Task, chunks: &[Chunk]) {
        for chunk in chunks {
            if !self.is_running() {
                return;
            }
            if chunk.is_finished() {
                continue;
            }
            if self.registry.len() >= self.max_workers() {
                break;
            }
            self.spawn_chunk_worker(task, chunk);
        }
    }

    fn spawn_chunk_worker(&mut self, task: &Task, chunk: &Chunk) {
        let key = WorkerKey::Chunk(chunk.id());
        if self.registry.contains_key(&key) {
            return;
        }
        self.next_instance += 1;
        let instance = self.next_instance;
        let span = Arc::new(ChunkSpan::new(chunk));
        let token = CancellationToken::new();
        let worker = ChunkWorker::new(
            task.clone(),
            chunk.clone(),
            self.files.chunk_file_path(task, chunk.id()),
            Arc::clone(&self.http),
            Arc::clone(&self.tasks),
            Arc::clone(&self.files),
            Arc::clone(&self.speed),
            Arc::clone(&span),
            token.clone(),
            WorkerSink::new(self.sink.clone(), instance),
        );
        debug!("启动 {} (task-{})", key, task.id());
        let join = tokio::spawn(worker.run());
        self.registry.insert(
            key,
            WorkerHandle {
                task_id: task.id(),
                instance,
                span: Some(span),
                token,
                join,
            },
        );
    }

    fn spawn_merge_worker(&mut self, task: &Task, chunks: &[Chunk]) {
        let key = WorkerKey::Merge(task.id());
        if self.registry.contains_key(&key) {
            return;
        }
        // 拆分出的分块 ID 更大但偏移靠中间，必须按起始偏移拼接
        let mut ordered: Vec<&Chunk> = chunks.iter().collect();
        ordered.sort_by_key(|c| (c.range().map(|(begin, _)| begin).unwrap_or(0), c.id()));
        let sources = ordered
            .iter()
            .map(|c| self.files.chunk_file_path(task, c.id()))
            .collect();

        self.next_instance += 1;
        let instance = self.next_instance;
        let token = CancellationToken::new();
        let worker = MergeWorker::new(
            task.clone(),
            sources,
            Arc::clone(&self.files),
            token.clone(),
            WorkerSink::new(self.sink.clone(), instance),
        );
        debug!("启动 {} (task-{})", key, task.id());
        let join = tokio::spawn(worker.run());
        self.registry.insert(
            key,
            WorkerHandle {
                task_id: task.id(),
                instance,
                span: None,
                token,
                join,
            },
        );
    }

    /// 运行中拆分：总是拆剩余字节最多的分块，拆一个加一条连接，
    /// 直到预算耗尽或最大的分块都拆不动
    fn split_large_chunks(&mut self, task: &Task) {
        if !task.is_resumable() {
            return;
        }
        // 快照该任务当前的分块 worker；并发到来的终结事件排在本轮
        // 之后处理，不影响遍历
        let mut running: Vec<(ChunkId, Arc<ChunkSpan>)> = self
            .registry
            .iter()
            .filter_map(|(key, handle)| {
                if handle.task_id != task.id() {
                    return None;
                }
                match (key, handle.span.as_ref()) {
                    (WorkerKey::Chunk(chunk_id), Some(span)) => {
                        Some((*chunk_id, Arc::clone(span)))
                    }
                    _ => None,
                }
            })
            .collect();

        let global_headroom = self.max_workers().saturating_sub(self.registry.len());
        let task_headroom = task
            .max_parallel_connections()
            .saturating_sub(running.len());
        let mut budget = global_headroom.min(task_headroom);
        if budget == 0 {
            return;
        }

        running.sort_by(|a, b| b.1.remaining().cmp(&a.1.remaining()));
        for (chunk_id, span) in running {
            match span.split(self.min_chunk_length) {
                Some((begin, end)) => {
                    self.tasks.set_chunk_end(chunk_id, begin - 1);
                    let tail = self
                        .tasks
                        .insert_chunk(Chunk::new(task.id(), Some((begin, end))));
                    debug!(
                        "chunk-{} 拆分出 chunk-{} [{}, {}] (task-{})",
                        chunk_id,
                        tail.id(),
                        begin,
                        end,
                        task.id()
                    );
                    self.spawn_chunk_worker(task, &tail);
                    budget -= 1;
                    if budget == 0 {
                        return;
                    }
                }
                // 最大的分块都拆不动，更小的更不值得拆
                None => return,
            }
        }
    }

    /// 只在实例号匹配时移出注册表，过期 worker 的事件不碰新句柄
    fn remove_if_current(&mut self, key: WorkerKey, instance: u64) {
        if self
            .registry
            .get(&key)
            .is_some_and(|handle| handle.instance == instance)
        {
            self.registry.remove(&key);
        }
    }

    /// 中断全部 worker 并等待退出，然后清空注册表
    ///
    /// 等待退出保证排在后面的调度作业看到的是完全停下来的世界，
    /// 新旧 worker 不会同时往一个溢写文件里写
    async fn interrupt_all(&mut self) {
        if self.registry.is_empty() {
            return;
        }
        debug!("中断 {} 个 worker", self.registry.len());
        for handle in self.registry.values() {
            handle.token.cancel();
        }
        for (_, handle) in self.registry.drain() {
            let _ = handle.join.await;
        }
    }

    /// 任务失败（终态吸收：已终结的任务不受影响）
    fn fail_task(&self, task_id: TaskId, reason: &str) {
        let Some(task) = self.tasks.find_task(task_id) else {
            return;
        };
        if task.state().is_terminal() {
            return;
        }
        let failed = self
            .tasks
            .update_task(task.with_state_message(TaskState::Failed, reason));
        self.dispatcher.task_failed(&failed);
    }

    /// 合并成功：Merging → Finished，清理溢写文件和分块记录
    async fn finish_task(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.find_task(task_id) else {
            return;
        };
        if task.state().is_terminal() {
            return;
        }
        let chunks = self.tasks.chunks_of_task(task_id);
        let finished = self
            .tasks
            .update_task(task.with_state_message(TaskState::Finished, "Successful"));
        info!(
            "task-{} 下载完成: {}",
            task_id,
            finished.save_path().display()
        );
        self.dispatcher.task_finished(&finished);
        for chunk in &chunks {
            let path = self.files.chunk_file_path(&finished, chunk.id());
            if let Err(e) = self.files.delete(&path).await {
                warn!("删除溢写文件失败: {e:#}");
            }
        }
        self.tasks.remove_chunks_of_task(task_id);
    }

    /// 取消清理：中断并等待该任务的全部 worker，删除溢写文件和分块记录
    async fn cleanup_task(&mut self, task_id: TaskId) {
        let keys: Vec<WorkerKey> = self
            .registry
            .iter()
            .filter(|(_, handle)| handle.task_id == task_id)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            if let Some(handle) = self.registry.remove(&key) {
                debug!("中断并等待 {} (task-{})", key, task_id);
                handle.token.cancel();
                let _ = handle.join.await;
            }
        }

        if let Some(task) = self.tasks.find_task(task_id) {
            for chunk in self.tasks.chunks_of_task(task_id) {
                let path = self.files.chunk_file_path(&task, chunk.id());
                if let Err(e) = self.files.delete(&path).await {
                    warn!("删除溢写文件失败: {e:#}");
                }
            }
        }
        self.tasks.remove_chunks_of_task(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::fs::mock::MockFileManager;
    use crate::io::http::mock::MockHttpClient;
    use crate::manager::MemoryTaskManager;

    fn downloader() -> (FileDownloader, Arc<MockHttpClient>) {
        let http = Arc::new(MockHttpClient::new());
        let downloader = FileDownloader::new(
            DownloaderConfig::builder().max_workers(4).build(),
            http.clone(),
            Arc::new(MockFileManager::new()),
            Arc::new(MemoryTaskManager::new()),
        );
        (downloader, http)
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let (downloader, _http) = downloader();
        let result = downloader.cancel_task(42);
        assert!(matches!(result, Err(DownloaderError::TaskNotFound(42))));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (downloader, _http) = downloader();
        let task = downloader
            .add_task(Task::builder("http://example.com/a.bin", "/tmp/a.bin").build())
            .unwrap();

        downloader.cancel_task(task.id()).unwrap();
        let stored = downloader
            .task_manager()
            .unwrap()
            .find_task(task.id())
            .unwrap();
        assert_eq!(stored.state(), TaskState::Failed);
        assert_eq!(stored.message(), "Cancelled");

        // 重复取消是空操作
        downloader.cancel_task(task.id()).unwrap();
    }

    #[tokio::test]
    async fn test_set_max_workers() {
        let (downloader, _http) = downloader();
        assert_eq!(downloader.get_max_workers(), 4);
        downloader.set_max_workers(8);
        assert_eq!(downloader.get_max_workers(), 8);
        // 相同取值重复设置是空操作
        downloader.set_max_workers(8);
        assert_eq!(downloader.get_max_workers(), 8);
        // 0 合法：调度空转
        downloader.set_max_workers(0);
        assert_eq!(downloader.get_max_workers(), 0);
    }

    #[tokio::test]
    async fn test_start_pause_flags() {
        let (downloader, _http) = downloader();
        assert!(!downloader.is_running());
        downloader.start();
        assert!(downloader.is_running());
        downloader.pause();
        assert!(!downloader.is_running());
    }

    #[tokio::test]
    async fn test_release_is_terminal() {
        let (downloader, _http) = downloader();
        assert!(!downloader.is_released());
        downloader.release().await;
        assert!(downloader.is_released());
        assert!(downloader.task_manager().is_none());
        assert!(downloader.http_client().is_none());
        assert!(downloader.file_manager().is_none());
        assert_eq!(downloader.get_speed(), 0);

        // 释放后写操作报错，重复释放是空操作
        let result =
            downloader.add_task(Task::builder("http://example.com/a.bin", "/tmp/a.bin").build());
        assert!(matches!(result, Err(DownloaderError::Released)));
        downloader.release().await;

        // 释放后 start 不再生效
        downloader.start();
        assert!(!downloader.is_running());
    }
}
