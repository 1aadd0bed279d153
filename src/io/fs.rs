//! 文件管理抽象
//!
//! 核心消费四类文件操作：定位分块溢写文件、追加写入、删除、按序拼接。
//! `truncate` 用于 worker 启动时把溢写文件对齐到已持久化的进度，
//! 保证"写文件"和"记进度"之间被打断也不会破坏续传。

use crate::model::chunk::ChunkId;
use crate::model::task::Task;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// 文件管理契约
#[async_trait]
pub trait FileManager: Send + Sync + 'static {
    /// 任务某个分块的溢写文件路径
    fn chunk_file_path(&self, task: &Task, chunk_id: ChunkId) -> PathBuf;

    /// 追加写入；文件不存在时创建
    async fn append(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// 截断（或扩展）文件到指定长度；文件不存在时创建
    async fn truncate(&self, path: &Path, len: u64) -> Result<()>;

    /// 删除文件；文件不存在不算错误
    async fn delete(&self, path: &Path) -> Result<()>;

    /// 把 `sources` 依次拼接成 `dest`（覆盖写）
    async fn concatenate(&self, dest: &Path, sources: &[PathBuf]) -> Result<()>;
}

/// 溢写文件命名：`<目标路径>.chunk<分块ID>`
fn default_chunk_file_path(task: &Task, chunk_id: ChunkId) -> PathBuf {
    PathBuf::from(format!("{}.chunk{}", task.save_path().display(), chunk_id))
}

/// 基于 tokio::fs 的默认文件管理器
///
/// 溢写文件和目标文件放在同一目录
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioFileManager;

impl TokioFileManager {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileManager for TokioFileManager {
    fn chunk_file_path(&self, task: &Task, chunk_id: ChunkId) -> PathBuf {
        default_chunk_file_path(task, chunk_id)
    }

    async fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("打开溢写文件失败: {}", path.display()))?;
        file.write_all(data)
            .await
            .with_context(|| format!("写入溢写文件失败: {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("刷新溢写文件失败: {}", path.display()))?;
        Ok(())
    }

    async fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .await
            .with_context(|| format!("打开溢写文件失败: {}", path.display()))?;
        file.set_len(len)
            .await
            .with_context(|| format!("截断溢写文件失败: {}", path.display()))?;
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("删除文件失败: {}", path.display())),
        }
    }

    async fn concatenate(&self, dest: &Path, sources: &[PathBuf]) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut dest_file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("创建目标文件失败: {}", dest.display()))?;
        for source in sources {
            let mut source_file = tokio::fs::File::open(source)
                .await
                .with_context(|| format!("打开溢写文件失败: {}", source.display()))?;
            tokio::io::copy(&mut source_file, &mut dest_file)
                .await
                .with_context(|| format!("拼接 {} 失败", source.display()))?;
        }
        dest_file
            .flush()
            .await
            .with_context(|| format!("刷新目标文件失败: {}", dest.display()))?;
        Ok(())
    }
}

// ============================================================================
// 测试用的 Mock 实现
// ============================================================================

/// 测试工具：内存文件管理器
pub mod mock {
    use super::{default_chunk_file_path, FileManager};
    use crate::model::chunk::ChunkId;
    use crate::model::task::Task;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    /// Mock 文件管理器：全部文件保存在内存中
    #[derive(Clone)]
    pub struct MockFileManager {
        files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
        /// 拼接前的人为延迟，用于测试合并期间的取消时机
        concat_latency: Arc<Mutex<Duration>>,
    }

    impl MockFileManager {
        pub fn new() -> Self {
            Self {
                files: Arc::new(Mutex::new(HashMap::new())),
                concat_latency: Arc::new(Mutex::new(Duration::ZERO)),
            }
        }

        /// 读取文件内容
        pub fn file(&self, path: &Path) -> Option<Vec<u8>> {
            self.files.lock().get(path).cloned()
        }

        /// 当前存在的所有文件路径
        pub fn paths(&self) -> Vec<PathBuf> {
            self.files.lock().keys().cloned().collect()
        }

        /// 设置拼接前的人为延迟
        pub fn set_concat_latency(&self, latency: Duration) {
            *self.concat_latency.lock() = latency;
        }
    }

    impl Default for MockFileManager {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl FileManager for MockFileManager {
        fn chunk_file_path(&self, task: &Task, chunk_id: ChunkId) -> PathBuf {
            default_chunk_file_path(task, chunk_id)
        }

        async fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
            self.files
                .lock()
                .entry(path.to_path_buf())
                .or_default()
                .extend_from_slice(data);
            Ok(())
        }

        async fn truncate(&self, path: &Path, len: u64) -> Result<()> {
            self.files
                .lock()
                .entry(path.to_path_buf())
                .or_default()
                .resize(len as usize, 0);
            Ok(())
        }

        async fn delete(&self, path: &Path) -> Result<()> {
            self.files.lock().remove(path);
            Ok(())
        }

        async fn concatenate(&self, dest: &Path, sources: &[PathBuf]) -> Result<()> {
            let latency = *self.concat_latency.lock();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let mut files = self.files.lock();
            let mut merged = Vec::new();
            for source in sources {
                match files.get(source) {
                    Some(data) => merged.extend_from_slice(data),
                    None => bail!("溢写文件不存在: {}", source.display()),
                }
            }
            files.insert(dest.to_path_buf(), merged);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockFileManager;
    use super::*;

    #[test]
    fn test_chunk_file_path_naming() {
        let task = Task::builder("http://example.com/a.bin", "/tmp/a.bin").build();
        let manager = TokioFileManager::new();
        assert_eq!(
            manager.chunk_file_path(&task, 7),
            PathBuf::from("/tmp/a.bin.chunk7")
        );
    }

    #[tokio::test]
    async fn test_mock_append_truncate_delete() {
        let manager = MockFileManager::new();
        let path = PathBuf::from("/virtual/a.bin.chunk1");

        manager.append(&path, b"hello ").await.unwrap();
        manager.append(&path, b"world").await.unwrap();
        assert_eq!(manager.file(&path).unwrap(), b"hello world");

        manager.truncate(&path, 5).await.unwrap();
        assert_eq!(manager.file(&path).unwrap(), b"hello");

        manager.delete(&path).await.unwrap();
        assert!(manager.file(&path).is_none());
        // 重复删除不算错误
        manager.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_concatenate_in_order() {
        let manager = MockFileManager::new();
        let a = PathBuf::from("/virtual/x.chunk1");
        let b = PathBuf::from("/virtual/x.chunk2");
        manager.append(&a, b"AAAA").await.unwrap();
        manager.append(&b, b"BB").await.unwrap();

        let dest = PathBuf::from("/virtual/x");
        manager
            .concatenate(&dest, &[a.clone(), b.clone()])
            .await
            .unwrap();
        assert_eq!(manager.file(&dest).unwrap(), b"AAAABB");

        // 缺失的溢写文件应该报错
        let missing = PathBuf::from("/virtual/x.chunk9");
        assert!(manager.concatenate(&dest, &[missing]).await.is_err());
    }

    #[tokio::test]
    async fn test_tokio_file_manager_round_trip() {
        let dir = std::env::temp_dir().join(format!("downpour_fs_test_{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let manager = TokioFileManager::new();
        let part1 = dir.join("out.bin.chunk1");
        let part2 = dir.join("out.bin.chunk2");
        let dest = dir.join("out.bin");

        manager.append(&part1, b"0123").await.unwrap();
        manager.append(&part1, b"4567").await.unwrap();
        manager.append(&part2, b"89").await.unwrap();

        // 截断到已持久化的进度
        manager.truncate(&part1, 6).await.unwrap();

        manager
            .concatenate(&dest, &[part1.clone(), part2.clone()])
            .await
            .unwrap();
        let merged = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(merged, b"01234589");

        manager.delete(&part1).await.unwrap();
        manager.delete(&part2).await.unwrap();
        manager.delete(&dest).await.unwrap();
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
