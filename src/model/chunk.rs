//! 分块模型
//!
//! 一个分块对应任务文件的一段连续字节区间，独立下载到各自的溢写文件。
//! 任务初始化后，分块区间两两不相交且并集恰好覆盖 `[0, length-1]`；
//! 运行中的拆分只会把一个区间一分为二，不破坏该不变式。

use crate::model::task::TaskId;

/// 分块 ID 类型
///
/// 由任务存储在插入时分配，全局稳定
pub type ChunkId = u64;

/// 一个分块：任务文件的闭区间 `[begin, end]` 或整个文件
#[derive(Debug, Clone)]
pub struct Chunk {
    id: ChunkId,
    task_id: TaskId,
    /// 闭区间 `[begin, end]`；`None` 表示"整个文件"（不可续传任务）
    range: Option<(u64, u64)>,
    /// 已下载并持久化的字节数，恢复下载的断点依据
    downloaded: u64,
    /// 对有界分块恒等于 `downloaded == 区间长度`；
    /// 对整文件分块由 worker 在 EOF 时置位
    finished: bool,
}

impl Chunk {
    /// 创建新分块
    ///
    /// ID 在插入任务存储时分配
    pub fn new(task_id: TaskId, range: Option<(u64, u64)>) -> Self {
        Self {
            id: 0,
            task_id,
            range,
            downloaded: 0,
            finished: false,
        }
    }

    #[inline]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    #[inline]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    #[inline]
    pub fn range(&self) -> Option<(u64, u64)> {
        self.range
    }

    #[inline]
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// 是否为"整个文件"分块
    #[inline]
    pub fn is_whole_file(&self) -> bool {
        self.range.is_none()
    }

    /// 区间长度；整文件分块长度未知
    #[inline]
    pub fn len(&self) -> Option<u64> {
        self.range.map(|(begin, end)| end - begin + 1)
    }

    /// 剩余字节数；整文件分块未知
    #[inline]
    pub fn remaining(&self) -> Option<u64> {
        self.len().map(|len| len.saturating_sub(self.downloaded))
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 分配稳定 ID，由任务存储实现在插入时调用
    pub fn assign_id(&mut self, id: ChunkId) {
        self.id = id;
    }

    /// 累加已下载字节数并同步 finished 标志，由任务存储实现调用
    pub fn add_downloaded(&mut self, bytes: u64) {
        self.downloaded += bytes;
        if let Some(len) = self.len() {
            self.finished = self.downloaded >= len;
        }
    }

    /// 收窄区间终点（拆分），由任务存储实现调用
    pub fn set_end(&mut self, end: u64) {
        if let Some((begin, _)) = self.range {
            self.range = Some((begin, end));
            self.finished = self.downloaded >= end - begin + 1;
        }
    }

    /// 整文件分块在 EOF 时置位，由任务存储实现调用
    pub fn mark_finished(&mut self) {
        self.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranged_chunk() {
        let mut chunk = Chunk::new(1, Some((0, 99)));
        assert_eq!(chunk.len(), Some(100));
        assert_eq!(chunk.remaining(), Some(100));
        assert!(!chunk.is_finished());

        chunk.add_downloaded(40);
        assert_eq!(chunk.remaining(), Some(60));
        assert!(!chunk.is_finished());

        chunk.add_downloaded(60);
        assert_eq!(chunk.remaining(), Some(0));
        assert!(chunk.is_finished());
    }

    #[test]
    fn test_whole_file_chunk() {
        let mut chunk = Chunk::new(1, None);
        assert!(chunk.is_whole_file());
        assert_eq!(chunk.len(), None);

        chunk.add_downloaded(1234);
        assert!(!chunk.is_finished());

        chunk.mark_finished();
        assert!(chunk.is_finished());
    }

    #[test]
    fn test_set_end_narrows_range() {
        let mut chunk = Chunk::new(1, Some((0, 999)));
        chunk.add_downloaded(100);
        chunk.set_end(499);
        assert_eq!(chunk.range(), Some((0, 499)));
        assert_eq!(chunk.remaining(), Some(400));
        assert!(!chunk.is_finished());

        // 收窄到恰好等于已下载量时立即视为完成
        chunk.set_end(99);
        assert!(chunk.is_finished());
    }
}
