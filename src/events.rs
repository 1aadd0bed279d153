//! 事件分发
//!
//! 把任务生命周期事件扇出给注册的监听器。每个监听器绑定一个执行器，
//! 事件作为作业提交到该执行器上运行；监听器内部的 panic 被就地捕获，
//! 不会传回调度核心。

use crate::model::task::Task;
use log::warn;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// 任务生命周期监听器
///
/// 所有方法都有空的默认实现，按需覆写
pub trait EventListener: Send + Sync + 'static {
    /// 任务插入任务存储后触发
    fn on_task_added(&self, _task: &Task) {}

    /// 任务状态迁移（Waiting / Merging）后触发
    fn on_task_updated(&self, _task: &Task) {}

    /// 任务成功完成后触发
    fn on_task_finished(&self, _task: &Task) {}

    /// 任务失败（包括被取消）后触发
    fn on_task_failed(&self, _task: &Task) {}
}

/// 监听器作业的执行器抽象
pub trait EventExecutor: Send + Sync + 'static {
    /// 提交一个作业
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// 把监听器作业投递到 tokio 运行时执行
///
/// 必须在 tokio 运行时内使用
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioExecutor;

impl EventExecutor for TokioExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        tokio::spawn(async move { job() });
    }
}

/// 在分发线程上同步执行监听器作业
///
/// 主要用于测试；监听器回调会直接运行在 Moderator 任务上，
/// 不要在回调里做耗时操作
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl EventExecutor for InlineExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

#[derive(Debug, Clone, Copy)]
enum TaskEvent {
    Added,
    Updated,
    Finished,
    Failed,
}

struct Registration {
    listener: Arc<dyn EventListener>,
    executor: Arc<dyn EventExecutor>,
}

/// 事件分发器
///
/// 以监听器的指针身份（`Arc::ptr_eq`）作为注销依据；同一个监听器
/// 重复注册只保留最新的执行器绑定。
pub(crate) struct EventDispatcher {
    registrations: Mutex<Vec<Registration>>,
}

impl EventDispatcher {
    pub(crate) fn new() -> Self {
        Self {
            registrations: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, listener: Arc<dyn EventListener>, executor: Arc<dyn EventExecutor>) {
        let mut registrations = self.registrations.lock();
        registrations.retain(|reg| !Arc::ptr_eq(&reg.listener, &listener));
        registrations.push(Registration { listener, executor });
    }

    pub(crate) fn unregister(&self, listener: &Arc<dyn EventListener>) {
        self.registrations
            .lock()
            .retain(|reg| !Arc::ptr_eq(&reg.listener, listener));
    }

    pub(crate) fn clear(&self) {
        self.registrations.lock().clear();
    }

    pub(crate) fn task_added(&self, task: &Task) {
        self.dispatch(TaskEvent::Added, task);
    }

    pub(crate) fn task_updated(&self, task: &Task) {
        self.dispatch(TaskEvent::Updated, task);
    }

    pub(crate) fn task_finished(&self, task: &Task) {
        self.dispatch(TaskEvent::Finished, task);
    }

    pub(crate) fn task_failed(&self, task: &Task) {
        self.dispatch(TaskEvent::Failed, task);
    }

    fn dispatch(&self, event: TaskEvent, task: &Task) {
        // 先把注册表快照出来再派发，监听器回调里重新注册 / 注销不会死锁
        let registrations: Vec<(Arc<dyn EventListener>, Arc<dyn EventExecutor>)> = self
            .registrations
            .lock()
            .iter()
            .map(|reg| (Arc::clone(&reg.listener), Arc::clone(&reg.executor)))
            .collect();
        for (listener, executor) in registrations {
            let task = task.clone();
            executor.execute(Box::new(move || {
                let result = catch_unwind(AssertUnwindSafe(|| match event {
                    TaskEvent::Added => listener.on_task_added(&task),
                    TaskEvent::Updated => listener.on_task_updated(&task),
                    TaskEvent::Finished => listener.on_task_finished(&task),
                    TaskEvent::Failed => listener.on_task_failed(&task),
                }));
                if result.is_err() {
                    warn!("事件监听器 panic，已忽略 (task-{})", task.id());
                }
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        added: AtomicUsize,
        finished: AtomicUsize,
    }

    impl CountingListener {
        fn new() -> Self {
            Self {
                added: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            }
        }
    }

    impl EventListener for CountingListener {
        fn on_task_added(&self, _task: &Task) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }

        fn on_task_finished(&self, _task: &Task) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickyListener;

    impl EventListener for PanickyListener {
        fn on_task_added(&self, _task: &Task) {
            panic!("listener boom");
        }
    }

    fn sample_task() -> Task {
        Task::builder("http://example.com/a.bin", "/tmp/a.bin").build()
    }

    #[test]
    fn test_dispatch_to_inline_executor() {
        let dispatcher = EventDispatcher::new();
        let listener = Arc::new(CountingListener::new());
        dispatcher.register(listener.clone(), Arc::new(InlineExecutor));

        let task = sample_task();
        dispatcher.task_added(&task);
        dispatcher.task_finished(&task);
        dispatcher.task_updated(&task);

        assert_eq!(listener.added.load(Ordering::SeqCst), 1);
        assert_eq!(listener.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_by_identity() {
        let dispatcher = EventDispatcher::new();
        let first = Arc::new(CountingListener::new());
        let second = Arc::new(CountingListener::new());
        dispatcher.register(first.clone(), Arc::new(InlineExecutor));
        dispatcher.register(second.clone(), Arc::new(InlineExecutor));

        let erased: Arc<dyn EventListener> = first.clone();
        dispatcher.unregister(&erased);
        dispatcher.task_added(&sample_task());

        assert_eq!(first.added.load(Ordering::SeqCst), 0);
        assert_eq!(second.added.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_panic_is_isolated() {
        let dispatcher = EventDispatcher::new();
        let counting = Arc::new(CountingListener::new());
        dispatcher.register(Arc::new(PanickyListener), Arc::new(InlineExecutor));
        dispatcher.register(counting.clone(), Arc::new(InlineExecutor));

        // panic 的监听器不能影响后续监听器和调用方
        dispatcher.task_added(&sample_task());
        assert_eq!(counting.added.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_removes_all() {
        let dispatcher = EventDispatcher::new();
        let listener = Arc::new(CountingListener::new());
        dispatcher.register(listener.clone(), Arc::new(InlineExecutor));
        dispatcher.clear();
        dispatcher.task_added(&sample_task());
        assert_eq!(listener.added.load(Ordering::SeqCst), 0);
    }
}
