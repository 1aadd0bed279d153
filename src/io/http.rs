//! HTTP 客户端抽象
//!
//! 核心消费两个操作：探测文件长度（Content-Length）和打开一个可选
//! 带字节范围的流式 GET。线格式就是普通 HTTP，范围请求使用
//! `Range: bytes=begin-end`（闭区间）。

use crate::model::task::Task;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// 流式响应体：按帧产出字节，EOF 以流结束表示，传输错误以 `Err` 项表示
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// HTTP 客户端契约
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// 探测任务文件的总长度
    async fn fetch_content_length(&self, task: &Task) -> Result<u64>;

    /// 打开流式 GET
    ///
    /// # Arguments
    ///
    /// * `range` - `Some((begin, end))` 请求闭区间字节范围；`None` 请求整个文件
    async fn open(&self, task: &Task, range: Option<(u64, u64)>) -> Result<ByteStream>;
}

/// 基于 reqwest 的默认 HTTP 客户端
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// 使用自定义的 `reqwest::Client`（代理、超时等）
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn fetch_content_length(&self, task: &Task) -> Result<u64> {
        let response = self
            .client
            .head(task.url())
            .send()
            .await
            .with_context(|| format!("HTTP HEAD 请求失败: {}", task.url()))?;
        let status = response.status();
        if !status.is_success() {
            bail!("HTTP HEAD 状态异常: {}", status);
        }
        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| anyhow!("响应缺少 Content-Length: {}", task.url()))
    }

    async fn open(&self, task: &Task, range: Option<(u64, u64)>) -> Result<ByteStream> {
        let mut request = self.client.get(task.url());
        if let Some((begin, end)) = range {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-{}", begin, end));
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("HTTP GET 请求失败: {}", task.url()))?;
        let status = response.status();
        if range.is_some() && status != reqwest::StatusCode::PARTIAL_CONTENT {
            bail!("服务器未按 Range 响应: {}", status);
        }
        if !status.is_success() {
            bail!("HTTP GET 状态异常: {}", status);
        }
        use futures::TryStreamExt;
        let stream = response.bytes_stream().map_err(anyhow::Error::from);
        Ok(Box::pin(stream))
    }
}

// ============================================================================
// 测试用的 Mock 实现
// ============================================================================

/// 测试工具：内存 HTTP 客户端
///
/// 预设响应体，按请求区间切片产出；支持注入探测失败、在指定全局
/// 偏移处毒化流，以及帧间延迟（便于测试暂停 / 取消时机）。
pub mod mock {
    use super::{ByteStream, HttpClient};
    use crate::model::task::Task;
    use anyhow::{anyhow, bail, Result};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Mock HTTP 客户端
    #[derive(Clone)]
    pub struct MockHttpClient {
        inner: Arc<Mutex<MockHttpState>>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    struct MockHttpState {
        /// URL → 完整响应体
        bodies: HashMap<String, Bytes>,
        /// URL → 长度探测的注入错误
        probe_failures: HashMap<String, String>,
        /// URL → (全局偏移, 错误信息)：流到达该偏移时报错
        poisoned: HashMap<String, (u64, String)>,
        /// 每帧字节数
        frame_size: usize,
        /// 帧间延迟
        latency: Duration,
        /// 请求日志
        request_log: Vec<String>,
    }

    /// 在流存活期间维持并发计数
    struct ActiveGuard {
        active: Arc<AtomicUsize>,
    }

    impl ActiveGuard {
        fn new(active: Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            Self { active }
        }
    }

    impl Drop for ActiveGuard {
        fn drop(&mut self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl MockHttpClient {
        pub fn new() -> Self {
            Self {
                inner: Arc::new(Mutex::new(MockHttpState {
                    bodies: HashMap::new(),
                    probe_failures: HashMap::new(),
                    poisoned: HashMap::new(),
                    frame_size: 8192,
                    latency: Duration::ZERO,
                    request_log: Vec::new(),
                })),
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// 设置 URL 的完整响应体
        pub fn set_body(&self, url: impl Into<String>, body: impl Into<Bytes>) {
            self.inner.lock().bodies.insert(url.into(), body.into());
        }

        /// 注入长度探测失败
        pub fn fail_content_length(&self, url: impl Into<String>, reason: impl Into<String>) {
            self.inner
                .lock()
                .probe_failures
                .insert(url.into(), reason.into());
        }

        /// 在全局偏移 `offset` 处毒化流：覆盖该偏移的范围请求会在
        /// 产出 `offset` 之前的字节后报错
        pub fn poison_at(&self, url: impl Into<String>, offset: u64, reason: impl Into<String>) {
            self.inner
                .lock()
                .poisoned
                .insert(url.into(), (offset, reason.into()));
        }

        /// 设置每帧字节数
        pub fn set_frame_size(&self, size: usize) {
            self.inner.lock().frame_size = size.max(1);
        }

        /// 设置帧间延迟
        pub fn set_latency(&self, latency: Duration) {
            self.inner.lock().latency = latency;
        }

        /// 获取请求日志
        pub fn request_log(&self) -> Vec<String> {
            self.inner.lock().request_log.clone()
        }

        /// 范围请求的数量
        pub fn range_request_count(&self) -> usize {
            self.inner
                .lock()
                .request_log
                .iter()
                .filter(|line| line.contains("Range"))
                .count()
        }

        /// 同时存活的流的峰值数量
        pub fn peak_concurrency(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    impl Default for MockHttpClient {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn fetch_content_length(&self, task: &Task) -> Result<u64> {
            let mut state = self.inner.lock();
            state.request_log.push(format!("HEAD {}", task.url()));
            if let Some(reason) = state.probe_failures.get(task.url()) {
                bail!("{}", reason.clone());
            }
            state
                .bodies
                .get(task.url())
                .map(|body| body.len() as u64)
                .ok_or_else(|| anyhow!("未设置响应体: {}", task.url()))
        }

        async fn open(&self, task: &Task, range: Option<(u64, u64)>) -> Result<ByteStream> {
            let (frames, latency, guard) = {
                let mut state = self.inner.lock();
                match range {
                    Some((begin, end)) => state
                        .request_log
                        .push(format!("GET {} Range: {}-{}", task.url(), begin, end)),
                    None => state.request_log.push(format!("GET {}", task.url())),
                }

                let body = state
                    .bodies
                    .get(task.url())
                    .cloned()
                    .ok_or_else(|| anyhow!("未设置响应体: {}", task.url()))?;
                let (begin, slice) = match range {
                    Some((begin, end)) => {
                        if end >= body.len() as u64 || begin > end {
                            bail!("Range 超出响应体: {}-{}", begin, end);
                        }
                        (begin, body.slice(begin as usize..=end as usize))
                    }
                    None => (0, body),
                };

                // 毒化偏移落在本次区间内时，流只产出该偏移之前的字节
                let poison = state.poisoned.get(task.url()).cloned();
                let limit = match &poison {
                    Some((offset, _)) if *offset >= begin && *offset < begin + slice.len() as u64 => {
                        (*offset - begin) as usize
                    }
                    _ => slice.len(),
                };

                let mut frames: Vec<Result<Bytes>> = Vec::new();
                let mut pos = 0;
                while pos < limit {
                    let end = (pos + state.frame_size).min(limit);
                    frames.push(Ok(slice.slice(pos..end)));
                    pos = end;
                }
                if limit < slice.len() {
                    let (_, reason) = poison.unwrap();
                    frames.push(Err(anyhow!("{}", reason)));
                }

                let guard = ActiveGuard::new(Arc::clone(&self.active), &self.peak);
                (frames, state.latency, guard)
            };

            // 逐帧产出，帧间注入延迟；guard 随流一起存活
            let stream = futures::stream::unfold(
                (frames.into_iter(), latency, guard),
                |(mut iter, latency, guard)| async move {
                    let item = iter.next()?;
                    if !latency.is_zero() {
                        tokio::time::sleep(latency).await;
                    }
                    Some((item, (iter, latency, guard)))
                },
            );
            Ok(Box::pin(stream))
        }
    }
}
