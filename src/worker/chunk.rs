//! 分块 worker
//!
//! 一个 worker 只负责下载一个分块的字节区间，流式追加到该分块的
//! 溢写文件，边下边把进度持久化到任务存储、把字节数上报给速度计。
//!
//! 拆分协调：worker 与 Moderator 共享一个 `ChunkSpan`。Moderator 在
//! 拆分时原子地收窄 span 的终点；worker 对收到的每一帧先经过
//! `ChunkSpan::accept` 裁剪，保证绝不越过收窄后的边界写入。

use crate::io::fs::FileManager;
use crate::io::http::HttpClient;
use crate::manager::TaskManager;
use crate::model::chunk::Chunk;
use crate::model::task::Task;
use crate::speed::SpeedMeter;
use crate::worker::WorkerSink;
use futures::StreamExt;
use log::{debug, error};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 分块 worker 与 Moderator 共享的区间状态
///
/// `begin` 不可变；`end` 只会被 Moderator 的拆分收窄；`downloaded`
/// 只被持有该 span 的 worker 推进。单把锁保证两者的读改写原子。
pub(crate) struct ChunkSpan {
    begin: u64,
    /// false 表示"整个文件"分块（不可续传任务），没有已知终点
    bounded: bool,
    inner: Mutex<SpanState>,
}

struct SpanState {
    end: u64,
    downloaded: u64,
}

impl ChunkSpan {
    pub(crate) fn new(chunk: &Chunk) -> Self {
        match chunk.range() {
            Some((begin, end)) => Self {
                begin,
                bounded: true,
                inner: Mutex::new(SpanState {
                    end,
                    downloaded: chunk.downloaded(),
                }),
            },
            None => Self {
                begin: 0,
                bounded: false,
                inner: Mutex::new(SpanState {
                    end: 0,
                    downloaded: 0,
                }),
            },
        }
    }

    /// 剩余字节数；整文件分块长度未知，视为最大（拆分排序时垫底无妨，
    /// 反正不可续传任务不会进拆分流程）
    pub(crate) fn remaining(&self) -> u64 {
        if !self.bounded {
            return u64::MAX;
        }
        let state = self.inner.lock();
        (state.end - self.begin + 1).saturating_sub(state.downloaded)
    }

    /// 本次 HTTP 请求的闭区间 `[begin + downloaded, end]`；整文件分块为 `None`
    pub(crate) fn request_range(&self) -> Option<(u64, u64)> {
        if !self.bounded {
            return None;
        }
        let state = self.inner.lock();
        Some((self.begin + state.downloaded, state.end))
    }

    /// 接收 `n` 字节：裁剪到当前终点并推进进度
    ///
    /// # Returns
    ///
    /// `(实际接收量, 是否恰好到达终点)`
    pub(crate) fn accept(&self, n: u64) -> (u64, bool) {
        let mut state = self.inner.lock();
        if !self.bounded {
            state.downloaded += n;
            return (n, false);
        }
        let len = state.end - self.begin + 1;
        let take = n.min(len.saturating_sub(state.downloaded));
        state.downloaded += take;
        (take, state.downloaded >= len)
    }

    /// 区间是否已全部下载
    pub(crate) fn is_complete(&self) -> bool {
        if !self.bounded {
            return false;
        }
        let state = self.inner.lock();
        state.downloaded >= state.end - self.begin + 1
    }

    /// 拆分：把剩余区间的后一半划给新分块，原子收窄本 span 的终点
    ///
    /// # Returns
    ///
    /// 新分块的闭区间；剩余不足 `2 × min_chunk_length` 或整文件分块
    /// 返回 `None`（"无可拆分"）
    pub(crate) fn split(&self, min_chunk_length: u64) -> Option<(u64, u64)> {
        if !self.bounded {
            return None;
        }
        let mut state = self.inner.lock();
        let len = state.end - self.begin + 1;
        let remaining = len.saturating_sub(state.downloaded);
        if remaining <= 2 * min_chunk_length {
            return None;
        }
        let keep = remaining / 2;
        let new_begin = self.begin + state.downloaded + keep;
        let tail_end = state.end;
        state.end = new_begin - 1;
        Some((new_begin, tail_end))
    }
}

/// 分块下载的终结方式
enum Outcome {
    Finished,
    Interrupted,
}

/// 分块 worker
///
/// `run` 消费自身，一生恰好通过 sink 发出一个终结事件：
/// 完成 / 错误 / 被中断。不重启；恢复下载由 Moderator 创建新 worker。
pub(crate) struct ChunkWorker {
    task: Task,
    chunk: Chunk,
    spill_path: PathBuf,
    http: Arc<dyn HttpClient>,
    tasks: Arc<dyn TaskManager>,
    files: Arc<dyn FileManager>,
    speed: Arc<SpeedMeter>,
    span: Arc<ChunkSpan>,
    token: CancellationToken,
    sink: WorkerSink,
}

impl ChunkWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        task: Task,
        chunk: Chunk,
        spill_path: PathBuf,
        http: Arc<dyn HttpClient>,
        tasks: Arc<dyn TaskManager>,
        files: Arc<dyn FileManager>,
        speed: Arc<SpeedMeter>,
        span: Arc<ChunkSpan>,
        token: CancellationToken,
        sink: WorkerSink,
    ) -> Self {
        Self {
            task,
            chunk,
            spill_path,
            http,
            tasks,
            files,
            speed,
            span,
            token,
            sink,
        }
    }

    pub(crate) async fn run(self) {
        let task_id = self.task.id();
        let chunk_id = self.chunk.id();
        match self.download().await {
            Ok(Outcome::Finished) => {
                debug!("chunk-{} 下载完成 (task-{})", chunk_id, task_id);
                self.sink.chunk_finished(task_id, chunk_id);
            }
            Ok(Outcome::Interrupted) => {
                debug!("chunk-{} 被中断 (task-{})", chunk_id, task_id);
                self.sink.chunk_interrupted(chunk_id);
            }
            Err(e) => {
                let reason = format!("{e:#}");
                error!("chunk-{} 下载失败 (task-{}): {}", chunk_id, task_id, reason);
                self.sink.chunk_error(task_id, chunk_id, reason);
            }
        }
    }

    async fn download(&self) -> anyhow::Result<Outcome> {
        // 把溢写文件对齐到已持久化的进度。整文件分块无法按范围续传，
        // 一律从头重下。
        let resume_from = if self.chunk.is_whole_file() {
            0
        } else {
            self.chunk.downloaded()
        };
        self.files.truncate(&self.spill_path, resume_from).await?;

        let range = self.span.request_range();
        debug!(
            "chunk-{} 请求 {:?} (已完成 {} 字节)",
            self.chunk.id(),
            range,
            resume_from
        );
        let mut stream = self.http.open(&self.task, range).await?;

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(Outcome::Interrupted),
                item = stream.next() => match item {
                    Some(Ok(bytes)) => {
                        let (take, done) = self.span.accept(bytes.len() as u64);
                        if take > 0 {
                            self.files
                                .append(&self.spill_path, &bytes[..take as usize])
                                .await?;
                            self.tasks.add_chunk_downloaded(self.chunk.id(), take);
                            self.speed.record(take);
                        }
                        if done {
                            return Ok(Outcome::Finished);
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        if self.chunk.is_whole_file() {
                            self.tasks.mark_chunk_finished(self.chunk.id());
                            return Ok(Outcome::Finished);
                        }
                        if self.span.is_complete() {
                            return Ok(Outcome::Finished);
                        }
                        anyhow::bail!("服务器提前结束响应，剩余 {} 字节", self.span.remaining());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranged_chunk(begin: u64, end: u64, downloaded: u64) -> Chunk {
        let mut chunk = Chunk::new(1, Some((begin, end)));
        chunk.add_downloaded(downloaded);
        chunk
    }

    #[test]
    fn test_span_accept_clips_at_end() {
        let span = ChunkSpan::new(&ranged_chunk(0, 99, 0));
        let (take, done) = span.accept(60);
        assert_eq!(take, 60);
        assert!(!done);

        // 超出终点的部分被裁掉
        let (take, done) = span.accept(100);
        assert_eq!(take, 40);
        assert!(done);

        // 到达终点后不再接收
        let (take, done) = span.accept(10);
        assert_eq!(take, 0);
        assert!(done);
    }

    #[test]
    fn test_span_request_range_resumes() {
        let span = ChunkSpan::new(&ranged_chunk(100, 299, 50));
        assert_eq!(span.request_range(), Some((150, 299)));
        assert_eq!(span.remaining(), 150);
    }

    #[test]
    fn test_span_split_halves_remaining() {
        let span = ChunkSpan::new(&ranged_chunk(0, 999, 100));
        // 剩余 900，min 100：留 450，新分块拿 [550, 999]
        let tail = span.split(100).unwrap();
        assert_eq!(tail, (550, 999));
        assert_eq!(span.request_range(), Some((100, 549)));

        // 拆分前后剩余总量不变
        let tail_len = tail.1 - tail.0 + 1;
        assert_eq!(span.remaining() + tail_len, 900);
    }

    #[test]
    fn test_span_split_respects_min_length() {
        let span = ChunkSpan::new(&ranged_chunk(0, 999, 0));
        // 剩余 1000 ≤ 2 × 500，无可拆分
        assert!(span.split(500).is_none());
        // 下限更小时可以拆
        assert!(span.split(400).is_some());
    }

    #[test]
    fn test_span_split_never_cuts_downloaded_bytes() {
        let span = ChunkSpan::new(&ranged_chunk(0, 999, 600));
        let tail = span.split(100).unwrap();
        // 新分块起点必须在已下载区域之后
        assert!(tail.0 > 600);
        assert!(!span.is_complete());
    }

    #[test]
    fn test_whole_file_span() {
        let span = ChunkSpan::new(&Chunk::new(1, None));
        assert_eq!(span.request_range(), None);
        assert_eq!(span.remaining(), u64::MAX);
        assert!(span.split(1).is_none());

        let (take, done) = span.accept(4096);
        assert_eq!(take, 4096);
        assert!(!done);
    }
}
