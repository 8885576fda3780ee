// 上传分片管理
//
// 分片规则：
// - 分片区间精确平铺 [0, file_size)，无空洞无重叠
// - 分片数 = ceil(file_size / chunk_size)
// - 分片数据惰性读取：首次访问才从磁盘加载，上传成功后默认释放
// - 重建分片时保留已成功分片，只重置失败/中断的分片

use crate::cache::CompletedChunk;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

/// 分片状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    /// 待上传
    Pending,
    /// 上传中
    Uploading,
    /// 已成功
    Success,
    /// 已失败（重试预算耗尽前会被重置回 Pending）
    Error,
}

/// 上传分片
#[derive(Debug, Clone)]
pub struct UploadChunk {
    /// 分片索引（0 起，连续）
    pub index: usize,
    /// 起始偏移（含）
    pub start: u64,
    /// 结束偏移（不含）
    pub end: u64,
    /// 分片状态
    pub status: ChunkStatus,
    /// 累计重试次数（跨暂停/恢复保留）
    pub retry_count: u32,
    /// 上传耗时 (ms)
    pub upload_time_ms: Option<u64>,
    /// 服务端返回的 etag
    pub etag: Option<String>,
    /// 最近一次失败的错误信息
    pub error: Option<String>,
    /// 分片数据，惰性加载
    pub data: Option<Vec<u8>>,
}

impl UploadChunk {
    pub fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            status: ChunkStatus::Pending,
            retry_count: 0,
            upload_time_ms: None,
            etag: None,
            error: None,
            data: None,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_success(&self) -> bool {
        self.status == ChunkStatus::Success
    }

    /// 释放数据缓冲
    pub fn release_data(&mut self) {
        self.data = None;
    }
}

/// 读取文件的 [start, end) 区间
pub async fn read_chunk_data(file_path: &Path, start: u64, end: u64) -> Result<Vec<u8>> {
    let mut file = File::open(file_path)
        .await
        .with_context(|| format!("打开上传文件失败: {:?}", file_path))?;

    file.seek(std::io::SeekFrom::Start(start))
        .await
        .context("文件定位失败")?;

    let size = (end - start) as usize;
    let mut buffer = vec![0u8; size];
    file.read_exact(&mut buffer)
        .await
        .context("读取分片数据失败")?;

    debug!("读取分片数据: bytes={}-{}, 大小={}", start, end - 1, size);
    Ok(buffer)
}

/// 解析生效的分片大小
///
/// 任务选项可覆盖全局配置，最终限制在 [min, max] 内
pub fn effective_chunk_size(requested: u64, min: u64, max: u64) -> u64 {
    requested.clamp(min.max(1), max.max(min.max(1)))
}

/// 按分片大小计算分片数
pub fn chunk_count_for(file_size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size) as usize
}

/// 上传分片管理器
///
/// 持有一个任务的全部分片，所有权归属任务本身
#[derive(Debug)]
pub struct UploadChunkManager {
    chunks: Vec<UploadChunk>,
    /// 文件总大小
    file_size: u64,
    /// 分片大小
    chunk_size: u64,
}

impl UploadChunkManager {
    /// 创建分片管理器并立即切分
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        let chunks = Self::calculate_chunks(file_size, chunk_size);
        info!(
            "创建分片管理器: 文件大小={} bytes, 分片大小={} bytes, 分片数={}",
            file_size,
            chunk_size,
            chunks.len()
        );
        Self {
            chunks,
            file_size,
            chunk_size,
        }
    }

    fn calculate_chunks(file_size: u64, chunk_size: u64) -> Vec<UploadChunk> {
        let mut chunks = Vec::with_capacity(chunk_count_for(file_size, chunk_size));
        let mut offset = 0u64;
        let mut index = 0;
        while offset < file_size {
            let end = std::cmp::min(offset + chunk_size, file_size);
            chunks.push(UploadChunk::new(index, offset, end));
            offset = end;
            index += 1;
        }
        chunks
    }

    /// 重建/刷新分片
    ///
    /// 分片数不变时按索引合并：已成功分片保留 etag 等元数据（区间重新推导），
    /// 失败和被中断的分片重置回待上传；累计重试次数始终保留。
    /// 分片数变化（如分片大小被调整）时全量重建。
    pub fn refresh(&mut self) {
        let fresh = Self::calculate_chunks(self.file_size, self.chunk_size);
        if fresh.len() != self.chunks.len() {
            if !self.chunks.is_empty() {
                warn!(
                    "分片数变化 {} -> {}，全量重建",
                    self.chunks.len(),
                    fresh.len()
                );
            }
            self.chunks = fresh;
            return;
        }

        for (chunk, blank) in self.chunks.iter_mut().zip(fresh) {
            chunk.start = blank.start;
            chunk.end = blank.end;
            match chunk.status {
                ChunkStatus::Success => {
                    // 已校验的区间不再重传
                }
                ChunkStatus::Error | ChunkStatus::Uploading => {
                    chunk.status = ChunkStatus::Pending;
                    chunk.error = None;
                }
                ChunkStatus::Pending => {}
            }
        }
    }

    /// 从持久化快照恢复已完成分片，返回恢复数量
    ///
    /// 调用方必须先通过文件标识校验（文件名+大小+分片大小一致）
    pub fn restore_from_snapshot(&mut self, completed: &[CompletedChunk]) -> usize {
        let mut restored = 0;
        for item in completed {
            if let Some(chunk) = self.chunks.get_mut(item.index) {
                if chunk.status != ChunkStatus::Success {
                    chunk.status = ChunkStatus::Success;
                    chunk.etag = item.etag.clone();
                    chunk.error = None;
                    restored += 1;
                }
            } else {
                warn!("快照分片索引越界: {}", item.index);
            }
        }
        if restored > 0 {
            info!("从快照恢复 {} 个已完成分片", restored);
        }
        restored
    }

    /// 导出已完成分片（持久化/合并请求用）
    pub fn completed_snapshot(&self) -> Vec<CompletedChunk> {
        self.chunks
            .iter()
            .filter(|c| c.is_success())
            .map(|c| CompletedChunk {
                index: c.index,
                etag: c.etag.clone(),
            })
            .collect()
    }

    /// 待上传分片索引（非 SUCCESS 全部算待传）
    pub fn pending_indices(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|c| !c.is_success())
            .map(|c| c.index)
            .collect()
    }

    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// 已完成分片数
    pub fn completed_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_success()).count()
    }

    /// 失败分片数
    pub fn failed_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Error)
            .count()
    }

    /// 已上传字节数
    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.is_success())
            .map(|c| c.size())
            .sum()
    }

    /// 是否全部完成
    pub fn is_completed(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(|c| c.is_success())
    }

    /// 取出分片区间（读数据时用，避免锁内做磁盘 IO）
    pub fn chunk_range(&self, index: usize) -> Option<(u64, u64)> {
        self.chunks.get(index).map(|c| (c.start, c.end))
    }

    /// 拿走分片缓存的数据（命中则无需再读磁盘）
    pub fn take_cached_data(&mut self, index: usize) -> Option<Vec<u8>> {
        self.chunks.get_mut(index).and_then(|c| c.data.take())
    }

    /// 回存分片数据（续传缓存开启时保留）
    pub fn store_data(&mut self, index: usize, data: Vec<u8>) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.data = Some(data);
        }
    }

    /// 标记分片上传中
    pub fn mark_uploading(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.status = ChunkStatus::Uploading;
        }
    }

    /// 标记分片成功
    ///
    /// `keep_data` 为 false 时释放数据缓冲
    pub fn mark_success(
        &mut self,
        index: usize,
        etag: Option<String>,
        upload_time_ms: u64,
        keep_data: bool,
    ) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.status = ChunkStatus::Success;
            chunk.etag = etag;
            chunk.upload_time_ms = Some(upload_time_ms);
            chunk.error = None;
            if !keep_data {
                chunk.data = None;
            }
        }
    }

    /// 标记分片失败
    pub fn mark_error(&mut self, index: usize, error: String) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.status = ChunkStatus::Error;
            chunk.error = Some(error);
        }
    }

    /// 分片重试 +1，返回累计次数
    pub fn increment_retry(&mut self, index: usize) -> u32 {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.retry_count += 1;
            chunk.retry_count
        } else {
            0
        }
    }

    pub fn retry_count(&self, index: usize) -> u32 {
        self.chunks.get(index).map(|c| c.retry_count).unwrap_or(0)
    }

    /// 被中断的分片（Uploading）重置回待上传，保留重试计数
    pub fn reset_interrupted(&mut self) {
        for chunk in &mut self.chunks {
            if chunk.status == ChunkStatus::Uploading {
                chunk.status = ChunkStatus::Pending;
            }
        }
    }

    /// 全量重置（任务级重试）：状态、重试计数、etag、缓冲全部清零
    pub fn reset(&mut self) {
        for chunk in &mut self.chunks {
            chunk.status = ChunkStatus::Pending;
            chunk.retry_count = 0;
            chunk.upload_time_ms = None;
            chunk.etag = None;
            chunk.error = None;
            chunk.data = None;
        }
    }

    /// 释放所有已成功分片的数据缓冲
    pub fn release_completed_buffers(&mut self) {
        for chunk in &mut self.chunks {
            if chunk.is_success() {
                chunk.data = None;
            }
        }
    }

    /// 释放全部分片的数据缓冲（任务到达终态后调用）
    pub fn release_all_buffers(&mut self) {
        for chunk in &mut self.chunks {
            chunk.data = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_chunk_creation() {
        let chunk = UploadChunk::new(0, 0, 1024);
        assert_eq!(chunk.index, 0);
        assert_eq!(chunk.size(), 1024);
        assert_eq!(chunk.status, ChunkStatus::Pending);
        assert!(chunk.data.is_none());
    }

    #[test]
    fn test_chunk_tiling() {
        // 整除
        let manager = UploadChunkManager::new(16 * 1024 * 1024, 4 * 1024 * 1024);
        assert_eq!(manager.chunk_count(), 4);
        assert_eq!(manager.chunks()[0].start, 0);
        assert_eq!(manager.chunks()[0].end, 4 * 1024 * 1024);
        assert_eq!(manager.chunks()[3].end, 16 * 1024 * 1024);

        // 尾分片不完整
        let manager = UploadChunkManager::new(10 * 1024 * 1024, 4 * 1024 * 1024);
        assert_eq!(manager.chunk_count(), 3);
        assert_eq!(manager.chunks()[2].size(), 2 * 1024 * 1024);
    }

    #[test]
    fn test_chunk_count_for() {
        assert_eq!(chunk_count_for(10 * 1024 * 1024, 2 * 1024 * 1024), 5);
        assert_eq!(chunk_count_for(1, 1024), 1);
        assert_eq!(chunk_count_for(1025, 1024), 2);
    }

    #[test]
    fn test_effective_chunk_size() {
        let min = 256 * 1024;
        let max = 32 * 1024 * 1024;
        assert_eq!(effective_chunk_size(4 * 1024 * 1024, min, max), 4 * 1024 * 1024);
        assert_eq!(effective_chunk_size(1, min, max), min);
        assert_eq!(effective_chunk_size(u64::MAX, min, max), max);
    }

    #[test]
    fn test_counters_and_completion() {
        let mut manager = UploadChunkManager::new(4096, 1024);
        assert_eq!(manager.completed_count(), 0);
        assert!(!manager.is_completed());

        manager.mark_success(0, Some("e0".to_string()), 10, false);
        manager.mark_success(1, Some("e1".to_string()), 12, false);
        assert_eq!(manager.completed_count(), 2);
        assert_eq!(manager.uploaded_bytes(), 2048);

        manager.mark_error(2, "boom".to_string());
        assert_eq!(manager.failed_count(), 1);
        assert_eq!(manager.pending_indices(), vec![2, 3]);

        manager.mark_success(2, None, 8, false);
        manager.mark_success(3, None, 8, false);
        assert!(manager.is_completed());
    }

    #[test]
    fn test_refresh_preserves_success() {
        let mut manager = UploadChunkManager::new(4096, 1024);
        manager.mark_success(0, Some("e0".to_string()), 10, false);
        manager.mark_error(1, "boom".to_string());
        manager.mark_uploading(2);
        let _ = manager.increment_retry(1);
        let _ = manager.increment_retry(1);

        manager.refresh();

        // 成功分片原样保留
        assert_eq!(manager.chunks()[0].status, ChunkStatus::Success);
        assert_eq!(manager.chunks()[0].etag.as_deref(), Some("e0"));
        // 失败/中断分片回到待上传，但累计重试保留
        assert_eq!(manager.chunks()[1].status, ChunkStatus::Pending);
        assert_eq!(manager.chunks()[1].retry_count, 2);
        assert_eq!(manager.chunks()[2].status, ChunkStatus::Pending);
    }

    #[test]
    fn test_restore_from_snapshot() {
        let mut manager = UploadChunkManager::new(4096, 1024);
        let snapshot = vec![
            CompletedChunk { index: 0, etag: Some("e0".to_string()) },
            CompletedChunk { index: 2, etag: None },
            // 越界索引被忽略
            CompletedChunk { index: 99, etag: None },
        ];

        assert_eq!(manager.restore_from_snapshot(&snapshot), 2);
        assert_eq!(manager.completed_count(), 2);
        assert_eq!(manager.pending_indices(), vec![1, 3]);
        assert_eq!(manager.chunks()[0].etag.as_deref(), Some("e0"));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut manager = UploadChunkManager::new(4096, 1024);
        manager.mark_success(1, Some("e1".to_string()), 5, false);
        manager.mark_success(3, Some("e3".to_string()), 5, false);

        let snapshot = manager.completed_snapshot();
        assert_eq!(snapshot.len(), 2);

        let mut restored = UploadChunkManager::new(4096, 1024);
        restored.restore_from_snapshot(&snapshot);
        assert_eq!(restored.completed_count(), 2);
        assert_eq!(restored.pending_indices(), vec![0, 2]);
    }

    #[test]
    fn test_full_reset_clears_retry_budget() {
        let mut manager = UploadChunkManager::new(2048, 1024);
        let _ = manager.increment_retry(0);
        let _ = manager.increment_retry(0);
        manager.mark_error(0, "boom".to_string());
        manager.mark_success(1, Some("e1".to_string()), 5, false);

        manager.reset();
        assert_eq!(manager.retry_count(0), 0);
        assert_eq!(manager.completed_count(), 0);
        assert!(manager.chunks()[1].etag.is_none());
    }

    #[tokio::test]
    async fn test_read_chunk_data_range() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&(0u8..=255).collect::<Vec<u8>>()).unwrap();

        let data = read_chunk_data(file.path(), 10, 20).await.unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(data[0], 10);
        assert_eq!(data[9], 19);
    }

    #[test]
    fn test_data_cache_take_and_store() {
        let mut manager = UploadChunkManager::new(2048, 1024);
        assert!(manager.take_cached_data(0).is_none());

        manager.store_data(0, vec![1, 2, 3]);
        assert_eq!(manager.take_cached_data(0), Some(vec![1, 2, 3]));
        // take 后缓冲已被拿走
        assert!(manager.take_cached_data(0).is_none());
    }

    proptest! {
        #[test]
        fn prop_chunks_tile_exactly(
            file_size in 1u64..64 * 1024 * 1024,
            chunk_size in 1u64..8 * 1024 * 1024,
        ) {
            let manager = UploadChunkManager::new(file_size, chunk_size);
            let chunks = manager.chunks();

            prop_assert_eq!(chunks.len(), chunk_count_for(file_size, chunk_size));
            prop_assert_eq!(chunks[0].start, 0);
            prop_assert_eq!(chunks[chunks.len() - 1].end, file_size);
            for pair in chunks.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
                prop_assert_eq!(pair[0].index + 1, pair[1].index);
            }
            let total: u64 = chunks.iter().map(|c| c.size()).sum();
            prop_assert_eq!(total, file_size);
        }
    }
}
