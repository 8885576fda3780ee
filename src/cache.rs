// 缓存模块
//
// 两类带 TTL 的缓存：
// 1. 续传进度缓存：按任务 ID 存储已成功分片的快照，恢复前校验文件名+大小
// 2. 秒传缓存：按 内容哈希:大小 记录"服务端已存在"，命中即跳过上传
// 均为内存缓存 + 可选 JSON 落盘；落盘失败仅告警，不影响上传流程

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

/// 缓存条目（值 + 过期时刻）
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry<T> {
    value: T,
    /// 过期时刻（Unix 秒）
    expires_at: i64,
}

/// 内存 TTL 缓存
///
/// 读取时惰性淘汰过期条目，线程安全
#[derive(Debug)]
pub struct TtlCache<T: Clone> {
    entries: DashMap<String, CacheEntry<T>>,
    ttl_secs: i64,
}

impl<T: Clone> TtlCache<T> {
    /// 创建缓存，`ttl_secs` 为条目默认有效期
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_secs,
        }
    }

    /// 写入条目（默认 TTL）
    pub fn put(&self, key: impl Into<String>, value: T) {
        self.put_with_expiry(key, value, Utc::now().timestamp() + self.ttl_secs);
    }

    /// 写入条目并指定过期时刻
    pub fn put_with_expiry(&self, key: impl Into<String>, value: T, expires_at: i64) {
        self.entries.insert(key.into(), CacheEntry { value, expires_at });
    }

    /// 读取条目，过期条目被移除并返回 None
    pub fn get(&self, key: &str) -> Option<T> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                if Utc::now().timestamp() < entry.expires_at {
                    return Some(entry.value.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// 移除条目
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// 清理所有过期条目，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now().timestamp();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        before - self.entries.len()
    }

    /// 导出所有未过期条目 (key, value, expires_at)
    pub fn entries(&self) -> Vec<(String, T, i64)> {
        let now = Utc::now().timestamp();
        self.entries
            .iter()
            .filter(|e| now < e.expires_at)
            .map(|e| (e.key().clone(), e.value.clone(), e.expires_at))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

// ==================== 续传进度缓存 ====================

/// 已成功分片记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedChunk {
    /// 分片序号
    pub index: usize,
    /// 服务端返回的 etag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// 续传进度快照
///
/// 任务暂停时写入，恢复时读取；使用前必须通过 `matches_file` 校验
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedProgressData {
    /// 任务 ID
    pub task_id: String,
    /// 源文件路径
    pub file_path: PathBuf,
    /// 文件名（恢复校验用）
    pub file_name: String,
    /// 文件大小（恢复校验用）
    pub file_size: u64,
    /// 内容哈希（如果已计算）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_md5: Option<String>,
    /// 分片大小（不一致时快照作废，分片边界已变）
    pub chunk_size: u64,
    /// 总分片数
    pub total_chunks: usize,
    /// 已成功的分片
    pub completed_chunks: Vec<CompletedChunk>,
    /// 保存时间（Unix 秒）
    pub saved_at: i64,
}

impl CachedProgressData {
    /// 校验快照是否仍然对应当前文件
    pub fn matches_file(&self, file_name: &str, file_size: u64) -> bool {
        self.file_name == file_name && self.file_size == file_size
    }
}

/// 续传进度存储
///
/// 内存缓存打底，配置了缓存目录时每个任务落盘一个 JSON 文件
#[derive(Debug)]
pub struct ProgressCacheStore {
    memory: TtlCache<CachedProgressData>,
    cache_dir: Option<PathBuf>,
    ttl_secs: i64,
}

impl ProgressCacheStore {
    pub fn new(cache_dir: Option<PathBuf>, ttl_secs: i64) -> Self {
        Self {
            memory: TtlCache::new(ttl_secs),
            cache_dir,
            ttl_secs,
        }
    }

    fn disk_path(&self, task_id: &str) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("progress_{}.json", task_id)))
    }

    /// 保存进度快照
    pub async fn save(&self, data: &CachedProgressData) {
        self.memory.put(data.task_id.clone(), data.clone());

        if let Some(path) = self.disk_path(&data.task_id) {
            if let Err(e) = self.write_json(&path, data).await {
                warn!("进度快照落盘失败: {} ({})", data.task_id, e);
            } else {
                debug!(
                    "进度快照已保存: {} ({}/{} 分片)",
                    data.task_id,
                    data.completed_chunks.len(),
                    data.total_chunks
                );
            }
        }
    }

    async fn write_json(&self, path: &PathBuf, data: &CachedProgressData) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec_pretty(data)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// 读取进度快照（内存优先，落盘兜底）
    ///
    /// 过期快照视为不存在
    pub async fn load(&self, task_id: &str) -> Option<CachedProgressData> {
        if let Some(data) = self.memory.get(task_id) {
            return Some(data);
        }

        let path = self.disk_path(task_id)?;
        let content = fs::read(&path).await.ok()?;
        let data: CachedProgressData = match serde_json::from_slice(&content) {
            Ok(data) => data,
            Err(e) => {
                warn!("进度快照解析失败: {} ({})", task_id, e);
                return None;
            }
        };

        if Utc::now().timestamp() >= data.saved_at + self.ttl_secs {
            debug!("进度快照已过期: {}", task_id);
            let _ = fs::remove_file(&path).await;
            return None;
        }

        self.memory
            .put_with_expiry(task_id.to_string(), data.clone(), data.saved_at + self.ttl_secs);
        Some(data)
    }

    /// 删除进度快照（任务成功/取消后调用）
    pub async fn remove(&self, task_id: &str) {
        self.memory.remove(task_id);
        if let Some(path) = self.disk_path(task_id) {
            let _ = fs::remove_file(path).await;
        }
    }

    /// 扫描落盘的全部未过期快照（进程重启后恢复任务用）
    pub async fn list_from_disk(&self) -> Vec<CachedProgressData> {
        let Some(dir) = &self.cache_dir else {
            return Vec::new();
        };
        let Ok(mut read_dir) = fs::read_dir(dir).await else {
            return Vec::new();
        };

        let now = Utc::now().timestamp();
        let mut snapshots = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("progress_") || !name.ends_with(".json") {
                continue;
            }
            let Ok(content) = fs::read(entry.path()).await else {
                continue;
            };
            match serde_json::from_slice::<CachedProgressData>(&content) {
                Ok(data) if now < data.saved_at + self.ttl_secs => snapshots.push(data),
                Ok(data) => {
                    debug!("跳过过期快照: {}", data.task_id);
                    let _ = fs::remove_file(entry.path()).await;
                }
                Err(e) => warn!("快照文件损坏: {:?} ({})", entry.path(), e),
            }
        }
        snapshots
    }

    /// 清理过期的落盘快照，返回清理数量
    pub async fn cleanup_expired(&self) -> usize {
        let purged_memory = self.memory.purge_expired();

        let Some(dir) = &self.cache_dir else {
            return purged_memory;
        };
        let Ok(mut read_dir) = fs::read_dir(dir).await else {
            return purged_memory;
        };

        let now = Utc::now().timestamp();
        let mut cleaned = 0;
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("progress_") || !name.ends_with(".json") {
                continue;
            }
            let Ok(content) = fs::read(entry.path()).await else {
                continue;
            };
            let expired = match serde_json::from_slice::<CachedProgressData>(&content) {
                Ok(data) => now >= data.saved_at + self.ttl_secs,
                // 损坏的快照一并清理
                Err(_) => true,
            };
            if expired && fs::remove_file(entry.path()).await.is_ok() {
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            info!("已清理 {} 个过期进度快照", cleaned);
        }
        purged_memory + cleaned
    }
}

// ==================== 秒传缓存 ====================

/// 秒传记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupRecord {
    /// 上传时的文件名（校验用）
    pub file_name: String,
    /// 文件大小
    pub file_size: u64,
    /// 服务端返回的文件引用
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// 记录时间（Unix 秒）
    pub uploaded_at: i64,
}

/// 落盘快照条目
#[derive(Debug, Serialize, Deserialize)]
struct DedupDiskEntry {
    key: String,
    record: DedupRecord,
    expires_at: i64,
}

/// 秒传缓存
///
/// 键为 `内容哈希:文件大小`；文件名不一致时记录作废（文件可能被改名复用）
#[derive(Debug)]
pub struct DedupCache {
    memory: TtlCache<DedupRecord>,
    cache_dir: Option<PathBuf>,
}

impl DedupCache {
    pub fn new(cache_dir: Option<PathBuf>, ttl_secs: i64) -> Self {
        Self {
            memory: TtlCache::new(ttl_secs),
            cache_dir,
        }
    }

    /// 构造缓存键
    ///
    /// `hash` 为文件 MD5；关闭哈希计算时调用方以文件名代替
    pub fn dedup_key(hash: &str, size: u64) -> String {
        format!("{}:{}", hash, size)
    }

    fn disk_path(&self) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join("dedup_cache.json"))
    }

    /// 查询秒传记录
    ///
    /// 命中但文件名不一致时记录作废并返回 None
    pub fn check(&self, hash: &str, size: u64, file_name: &str) -> Option<DedupRecord> {
        let key = Self::dedup_key(hash, size);
        let record = self.memory.get(&key)?;
        if record.file_name != file_name {
            debug!(
                "秒传记录文件名不一致（{} != {}），作废",
                record.file_name, file_name
            );
            self.memory.remove(&key);
            return None;
        }
        Some(record)
    }

    /// 写入秒传记录
    pub fn record(&self, hash: &str, size: u64, record: DedupRecord) {
        self.memory.put(Self::dedup_key(hash, size), record);
    }

    /// 从磁盘加载缓存（启动时调用），返回加载条目数
    pub async fn load_from_disk(&self) -> usize {
        let Some(path) = self.disk_path() else {
            return 0;
        };
        let Ok(content) = fs::read(&path).await else {
            return 0;
        };
        let entries: Vec<DedupDiskEntry> = match serde_json::from_slice(&content) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("秒传缓存文件损坏，忽略: {}", e);
                return 0;
            }
        };

        let now = Utc::now().timestamp();
        let mut loaded = 0;
        for entry in entries {
            if now < entry.expires_at {
                self.memory
                    .put_with_expiry(entry.key, entry.record, entry.expires_at);
                loaded += 1;
            }
        }
        if loaded > 0 {
            info!("已加载 {} 条秒传记录", loaded);
        }
        loaded
    }

    /// 持久化缓存到磁盘
    pub async fn persist_to_disk(&self) {
        let Some(path) = self.disk_path() else {
            return;
        };
        let entries: Vec<DedupDiskEntry> = self
            .memory
            .entries()
            .into_iter()
            .map(|(key, record, expires_at)| DedupDiskEntry {
                key,
                record,
                expires_at,
            })
            .collect();

        let write = async {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let content = serde_json::to_vec_pretty(&entries)?;
            fs::write(&path, content).await?;
            anyhow::Ok(())
        };
        if let Err(e) = write.await {
            warn!("秒传缓存落盘失败: {}", e);
        }
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_progress(task_id: &str) -> CachedProgressData {
        CachedProgressData {
            task_id: task_id.to_string(),
            file_path: PathBuf::from("/tmp/a.bin"),
            file_name: "a.bin".to_string(),
            file_size: 1024,
            file_md5: Some("abc".to_string()),
            chunk_size: 256,
            total_chunks: 4,
            completed_chunks: vec![CompletedChunk {
                index: 0,
                etag: Some("etag-0".to_string()),
            }],
            saved_at: Utc::now().timestamp(),
        }
    }

    #[test]
    fn test_ttl_cache_basic() {
        let cache: TtlCache<String> = TtlCache::new(3600);
        cache.put("k1", "v1".to_string());
        assert_eq!(cache.get("k1"), Some("v1".to_string()));
        assert!(cache.remove("k1"));
        assert_eq!(cache.get("k1"), None);
    }

    #[test]
    fn test_ttl_cache_expiry() {
        // TTL 为 0，写入即过期
        let cache: TtlCache<u32> = TtlCache::new(0);
        cache.put("k1", 1);
        assert_eq!(cache.get("k1"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ttl_cache_purge() {
        let cache: TtlCache<u32> = TtlCache::new(3600);
        cache.put("alive", 1);
        cache.put_with_expiry("stale", 2, Utc::now().timestamp() - 10);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_progress_matches_file() {
        let data = sample_progress("t1");
        assert!(data.matches_file("a.bin", 1024));
        assert!(!data.matches_file("b.bin", 1024));
        assert!(!data.matches_file("a.bin", 2048));
    }

    #[tokio::test]
    async fn test_progress_store_disk_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ProgressCacheStore::new(Some(dir.path().to_path_buf()), 3600);

        store.save(&sample_progress("t1")).await;

        // 新实例只能靠磁盘命中
        let fresh = ProgressCacheStore::new(Some(dir.path().to_path_buf()), 3600);
        let loaded = fresh.load("t1").await.unwrap();
        assert_eq!(loaded.total_chunks, 4);
        assert_eq!(loaded.completed_chunks.len(), 1);
        assert_eq!(loaded.completed_chunks[0].etag.as_deref(), Some("etag-0"));

        fresh.remove("t1").await;
        assert!(fresh.load("t1").await.is_none());
    }

    #[tokio::test]
    async fn test_progress_store_expiry() {
        let dir = TempDir::new().unwrap();
        let store = ProgressCacheStore::new(Some(dir.path().to_path_buf()), 100);

        let mut data = sample_progress("t1");
        data.saved_at = Utc::now().timestamp() - 500; // 早已过期
        store.write_json(&store.disk_path("t1").unwrap(), &data).await.unwrap();

        assert!(store.load("t1").await.is_none());
    }

    #[tokio::test]
    async fn test_progress_store_list_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let store = ProgressCacheStore::new(Some(dir.path().to_path_buf()), 300);

        store.save(&sample_progress("t1")).await;
        store.save(&sample_progress("t2")).await;

        let mut stale = sample_progress("t3");
        stale.saved_at = Utc::now().timestamp() - 1000;
        store.write_json(&store.disk_path("t3").unwrap(), &stale).await.unwrap();

        let listed = store.list_from_disk().await;
        let mut ids: Vec<String> = listed.into_iter().map(|d| d.task_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["t1", "t2"]);

        // t3 已在 list 时顺带清掉，再造一个过期文件验证 cleanup
        store.write_json(&store.disk_path("t4").unwrap(), &stale).await.unwrap();
        let cleaned = store.cleanup_expired().await;
        assert!(cleaned >= 1);
    }

    #[test]
    fn test_dedup_check_and_name_mismatch() {
        let cache = DedupCache::new(None, 3600);
        let record = DedupRecord {
            file_name: "a.bin".to_string(),
            file_size: 1024,
            file_url: Some("http://example.com/a".to_string()),
            uploaded_at: Utc::now().timestamp(),
        };
        cache.record("hash1", 1024, record);

        assert!(cache.check("hash1", 1024, "a.bin").is_some());
        // 文件名不一致 → 记录作废
        assert!(cache.check("hash1", 1024, "renamed.bin").is_none());
        // 作废后原文件名也查不到
        assert!(cache.check("hash1", 1024, "a.bin").is_none());
    }

    #[tokio::test]
    async fn test_dedup_disk_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = DedupCache::new(Some(dir.path().to_path_buf()), 3600);
        cache.record(
            "hash1",
            2048,
            DedupRecord {
                file_name: "b.bin".to_string(),
                file_size: 2048,
                file_url: None,
                uploaded_at: Utc::now().timestamp(),
            },
        );
        cache.persist_to_disk().await;

        let fresh = DedupCache::new(Some(dir.path().to_path_buf()), 3600);
        assert_eq!(fresh.load_from_disk().await, 1);
        assert!(fresh.check("hash1", 2048, "b.bin").is_some());
    }
}
