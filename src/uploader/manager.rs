// 上传管理器
//
// 负责多任务编排：
// - 校验入队（优先级排序）
// - 并发调度（活跃任务数始终不超过上限）
// - 暂停/恢复/取消/重试，全局批量操作
// - 聚合进度、速度与队列事件
// - 启动时恢复未完成任务
//
// 三个集合由管理器独占：pending（按优先级排序的待调度队列，
// 暂停任务停放其中）、active（运行中，按 id 索引）、completed
// （已到终态）。任务在任一时刻只属于其中一个集合，取消的任务
// 从所有集合移除。

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cache::{DedupCache, ProgressCacheStore};
use crate::config::UploaderConfig;
use crate::error::RejectedFile;
use crate::events::{CallbackManager, ProgressThrottler, UploadEvent};
use crate::uploader::adaptive::AdaptiveTuner;
use crate::uploader::chunk;
use crate::uploader::client::{ChunkClient, RequestTransformer};
use crate::uploader::engine::{RunOutcome, TaskHandle, UploadEngine};
use crate::uploader::speed::{SpeedCalculator, TimeEstimator};
use crate::uploader::task::{TaskOptions, TaskStatus, UploadTask};
use crate::uploader::validate::FileValidator;

/// 聚合统计快照
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadStats {
    /// 待调度任务数（不含停放的暂停任务）
    pub pending_count: usize,
    /// 上传中任务数
    pub active_count: usize,
    /// 停放的暂停任务数
    pub paused_count: usize,
    /// 成功任务数
    pub success_count: usize,
    /// 失败任务数
    pub error_count: usize,
    /// 全部任务字节数
    pub total_bytes: u64,
    /// 已上传字节数
    pub uploaded_bytes: u64,
    /// 总体进度（0.0 - 100.0）
    pub overall_progress: f64,
    /// 瞬时总速度（字节/秒）
    pub current_speed: u64,
    /// 平均速度（字节/秒）
    pub average_speed: u64,
    /// 预计剩余时间（秒）
    pub eta_secs: Option<u64>,
    /// 网络质量：unknown / slow / normal / fast
    pub network_quality: String,
}

/// 上传管理器
pub struct UploadManager {
    config: Arc<UploaderConfig>,
    client: ChunkClient,
    validator: FileValidator,
    events: Arc<CallbackManager>,
    dedup: Arc<DedupCache>,
    progress_store: Arc<ProgressCacheStore>,
    tuner: Arc<AdaptiveTuner>,
    /// 待调度队列：priority 大者在前，同级小文件在前；暂停任务停放于此
    pending: Mutex<VecDeque<Arc<TaskHandle>>>,
    /// 运行中任务
    active: DashMap<String, Arc<TaskHandle>>,
    /// 已到终态的任务
    completed: Mutex<Vec<Arc<TaskHandle>>>,
    /// 全局暂停标记，置位时调度循环不再启动新任务
    global_paused: AtomicBool,
    /// 用户声明的并发上限（自适应调节的天花板）
    declared_files: AtomicUsize,
    declared_chunks: AtomicUsize,
    /// 当前生效的分片重试预算（对新启动的任务生效）
    max_retries: AtomicU32,
    /// 引擎结算通道
    settle_tx: UnboundedSender<(String, RunOutcome)>,
    /// 全局速度窗口（按监控周期采样）
    global_speed: SpeedCalculator,
    global_eta: TimeEstimator,
    aggregate_throttler: ProgressThrottler,
}

impl UploadManager {
    /// 用默认请求形状创建管理器
    pub async fn new(config: UploaderConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let client = ChunkClient::new(config.endpoints.clone(), &config.request)?;
        Self::build(config, client).await
    }

    /// 用自定义请求形状创建管理器
    pub async fn with_transformer(
        config: UploaderConfig,
        transformer: Arc<dyn RequestTransformer>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let client =
            ChunkClient::with_transformer(config.endpoints.clone(), &config.request, transformer)?;
        Self::build(config, client).await
    }

    async fn build(config: UploaderConfig, client: ChunkClient) -> Result<Arc<Self>> {
        let config = Arc::new(config);

        // 缓存关闭时不落盘，仅内存
        let cache_dir = if config.features.enable_cache {
            config.cache.cache_dir.clone()
        } else {
            None
        };
        let progress_store = Arc::new(ProgressCacheStore::new(
            cache_dir.clone(),
            config.cache.progress_ttl_secs,
        ));
        let dedup = Arc::new(DedupCache::new(cache_dir.clone(), config.cache.dedup_ttl_secs));
        if cache_dir.is_some() {
            dedup.load_from_disk().await;
            progress_store.cleanup_expired().await;
        }

        let tuner = Arc::new(AdaptiveTuner::new(
            config.adaptive.clone(),
            &config.concurrency,
            config.features.network_adaptation,
        ));

        info!(
            "上传管理器就绪: 并发文件={}, 并发分片={}, 分片大小={} KB, 自适应={}",
            config.concurrency.max_concurrent_files,
            config.concurrency.max_concurrent_chunks,
            config.chunking.chunk_size / 1024,
            config.features.network_adaptation
        );

        let (settle_tx, settle_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            validator: FileValidator::new(config.filters.clone()),
            declared_files: AtomicUsize::new(config.concurrency.max_concurrent_files),
            declared_chunks: AtomicUsize::new(config.concurrency.max_concurrent_chunks),
            max_retries: AtomicU32::new(config.retry.max_retries),
            config,
            client,
            events: Arc::new(CallbackManager::new()),
            dedup,
            progress_store,
            tuner,
            pending: Mutex::new(VecDeque::new()),
            active: DashMap::new(),
            completed: Mutex::new(Vec::new()),
            global_paused: AtomicBool::new(false),
            settle_tx,
            global_speed: SpeedCalculator::new(),
            global_eta: TimeEstimator::new(),
            aggregate_throttler: ProgressThrottler::default(),
        });

        Self::spawn_settle_loop(&manager, settle_rx);
        Self::spawn_monitor(&manager);
        Ok(manager)
    }

    /// 事件注册入口
    pub fn events(&self) -> &Arc<CallbackManager> {
        &self.events
    }

    /// 注册事件回调，返回监听器 id
    pub fn on<F>(&self, event_type: &str, callback: F) -> u64
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.events.on(event_type, callback)
    }

    /// 注册一次性回调
    pub fn once<F>(&self, event_type: &str, callback: F) -> u64
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.events.once(event_type, callback)
    }

    /// 注销回调
    pub fn off(&self, event_type: &str, listener_id: u64) -> bool {
        self.events.off(event_type, listener_id)
    }

    // ------------------------------------------------------------------
    // 任务入队
    // ------------------------------------------------------------------

    /// 校验并入队一批文件，返回 (任务 id 列表, 被拒绝文件列表)
    pub async fn add_files(&self, paths: Vec<PathBuf>) -> (Vec<String>, Vec<RejectedFile>) {
        self.add_files_with_options(paths, TaskOptions::default())
            .await
    }

    /// 带任务选项入队（优先级、分片大小覆盖、自定义参数）
    pub async fn add_files_with_options(
        &self,
        paths: Vec<PathBuf>,
        options: TaskOptions,
    ) -> (Vec<String>, Vec<RejectedFile>) {
        let current = self.task_count().await;
        let (accepted, rejected) = self.validator.validate_batch(&paths, current).await;

        let mut task_ids = Vec::with_capacity(accepted.len());
        for file in accepted {
            let requested = options.chunk_size.unwrap_or(self.config.chunking.chunk_size);
            let chunk_size = chunk::effective_chunk_size(
                requested,
                self.config.chunking.min_chunk_size,
                self.config.chunking.max_chunk_size,
            );
            let task = UploadTask::new_with_options(
                file.path,
                file.file_name.clone(),
                file.file_size,
                options.clone(),
            );
            let handle = TaskHandle::new(task, chunk_size);
            task_ids.push(handle.id.clone());

            info!(
                "创建上传任务: id={}, file={}, size={}, priority={}",
                handle.id, file.file_name, file.file_size, handle.priority
            );
            self.events.emit(&UploadEvent::Created {
                task_id: handle.id.clone(),
                file_name: file.file_name,
                file_size: file.file_size,
            });
            self.enqueue(handle).await;
        }

        if !task_ids.is_empty() {
            self.emit_queue_changed().await;
            self.schedule().await;
        }
        (task_ids, rejected)
    }

    /// 按优先级插入：priority 大者在前，同级按文件小者在前
    async fn enqueue(&self, handle: Arc<TaskHandle>) {
        let mut pending = self.pending.lock().await;
        let position = pending.iter().position(|existing| {
            existing.priority < handle.priority
                || (existing.priority == handle.priority && existing.file_size > handle.file_size)
        });
        match position {
            Some(index) => pending.insert(index, handle),
            None => pending.push_back(handle),
        }
    }

    // ------------------------------------------------------------------
    // 调度
    // ------------------------------------------------------------------

    /// 调度循环：只要有空位且队列里有可启动任务就补位
    ///
    /// 容量检查、出队和占位在 pending 锁内完成，并发结算不会超发
    async fn schedule(&self) {
        if self.global_paused.load(Ordering::SeqCst) {
            return;
        }
        loop {
            let next = {
                let mut pending = self.pending.lock().await;
                let (max_files, _) = self.tuner.current_limits();
                if self.active.len() >= max_files.max(1) {
                    None
                } else {
                    // 停放的暂停任务跳过，取队列中第一个可启动的
                    pending
                        .iter()
                        .position(|h| !h.is_paused())
                        .and_then(|index| pending.remove(index))
                        .map(|handle| {
                            self.active.insert(handle.id.clone(), Arc::clone(&handle));
                            handle
                        })
                }
            };
            let Some(handle) = next else { break };
            self.spawn_task(handle).await;
        }
    }

    async fn spawn_task(&self, handle: Arc<TaskHandle>) {
        // 候选任务的暂停标记必然为假，这里不清标记：
        // 占位到启动之间插入的暂停请求要能留住
        handle.renew_run_token();
        let (_, chunk_limit) = self.tuner.current_limits();

        let engine = UploadEngine::new(
            Arc::clone(&handle),
            self.client.clone(),
            self.effective_config(),
            Arc::clone(&self.events),
            Arc::clone(&self.dedup),
            Arc::clone(&self.progress_store),
            chunk_limit,
        );
        let settle_tx = self.settle_tx.clone();
        let task_id = handle.id.clone();
        tokio::spawn(async move {
            let outcome = engine.run().await;
            // 管理器已释放时结果丢弃
            let _ = settle_tx.send((task_id, outcome));
        });
        self.emit_queue_changed().await;
    }

    fn spawn_settle_loop(manager: &Arc<Self>, mut settle_rx: UnboundedReceiver<(String, RunOutcome)>) {
        let weak = Arc::downgrade(manager);
        tokio::spawn(async move {
            while let Some((task_id, outcome)) = settle_rx.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.handle_settled(task_id, outcome).await;
            }
        });
    }

    /// 引擎结算：移出 active，按结束方式归位，再补位调度
    async fn handle_settled(&self, task_id: String, outcome: RunOutcome) {
        let Some((_, handle)) = self.active.remove(&task_id) else {
            return;
        };

        match outcome {
            RunOutcome::Success | RunOutcome::Failed => {
                self.completed.lock().await.push(handle);
                if outcome == RunOutcome::Success
                    && self.config.features.enable_cache
                    && self.config.cache.cache_dir.is_some()
                {
                    let dedup = Arc::clone(&self.dedup);
                    tokio::spawn(async move {
                        dedup.persist_to_disk().await;
                    });
                }
            }
            RunOutcome::Paused => {
                // 暂停结算落地前任务可能已被取消：取消优先，不回队。
                // 引擎的暂停快照可能晚于取消清理写入，这里补删
                if handle.status().await == TaskStatus::Cancelled {
                    self.progress_store.remove(&task_id).await;
                } else {
                    // 停回队首，恢复时最先调度
                    self.pending.lock().await.push_front(handle);
                }
            }
            RunOutcome::Cancelled => {
                drop(handle);
            }
        }

        self.emit_queue_changed().await;
        // 结算是聚合进度的关键节点，绕过节流，保证最后的 100% 必达
        self.emit_total_progress(true).await;
        self.schedule().await;
        self.maybe_emit_drained().await;
    }

    /// 队列排空时的终态事件：有失败发 AllFailed，否则无暂停才发 AllCompleted
    async fn maybe_emit_drained(&self) {
        if !self.active.is_empty() {
            return;
        }
        let (has_runnable, has_parked) = {
            let pending = self.pending.lock().await;
            (
                pending.iter().any(|h| !h.is_paused()),
                pending.iter().any(|h| h.is_paused()),
            )
        };
        if has_runnable {
            return;
        }

        let mut success_ids = Vec::new();
        let mut failed_ids = Vec::new();
        {
            let completed = self.completed.lock().await;
            for handle in completed.iter() {
                match handle.status().await {
                    TaskStatus::Success => success_ids.push(handle.id.clone()),
                    TaskStatus::Error => failed_ids.push(handle.id.clone()),
                    _ => {}
                }
            }
        }

        if !failed_ids.is_empty() {
            info!("队列排空: {} 个任务失败", failed_ids.len());
            self.events.emit(&UploadEvent::AllFailed {
                failed_task_ids: failed_ids,
            });
        } else if !success_ids.is_empty()
            && !has_parked
            && !self.global_paused.load(Ordering::SeqCst)
        {
            info!("✓ 队列排空: {} 个任务全部完成", success_ids.len());
            self.events.emit(&UploadEvent::AllCompleted {
                task_ids: success_ids,
            });
        }
    }

    // ------------------------------------------------------------------
    // 单任务操作
    // ------------------------------------------------------------------

    /// 暂停任务（PENDING 或 UPLOADING）
    pub async fn pause_task(&self, task_id: &str) -> Result<()> {
        let handle = self
            .find_handle(task_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("任务不存在: {}", task_id))?;

        let old_status = {
            let mut task = handle.task.lock().await;
            if !task.can_pause() {
                anyhow::bail!("任务当前状态不支持暂停: {}", task.status);
            }
            let old = task.status.as_str();
            task.mark_paused();
            old
        };
        handle.set_paused(true);
        handle.cancel_run();

        info!("暂停上传任务: {}", task_id);
        self.events.emit(&UploadEvent::StatusChanged {
            task_id: task_id.to_string(),
            old_status: old_status.to_string(),
            new_status: TaskStatus::Paused.as_str().to_string(),
        });
        self.events.emit(&UploadEvent::Paused {
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    /// 恢复暂停的任务：移到队首并立即尝试调度
    pub async fn resume_task(&self, task_id: &str) -> Result<()> {
        let handle = self
            .find_handle(task_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("任务不存在: {}", task_id))?;

        {
            let mut task = handle.task.lock().await;
            if task.status != TaskStatus::Paused {
                anyhow::bail!("任务不是暂停状态: {}", task_id);
            }
            task.mark_resumed();
        }
        handle.set_paused(false);

        {
            let mut pending = self.pending.lock().await;
            if let Some(position) = pending.iter().position(|h| h.id == task_id) {
                if let Some(h) = pending.remove(position) {
                    pending.push_front(h);
                }
            }
        }

        info!("恢复上传任务: {}", task_id);
        self.events.emit(&UploadEvent::StatusChanged {
            task_id: task_id.to_string(),
            old_status: TaskStatus::Paused.as_str().to_string(),
            new_status: TaskStatus::Pending.as_str().to_string(),
        });
        self.events.emit(&UploadEvent::Resumed {
            task_id: task_id.to_string(),
        });
        self.schedule().await;
        Ok(())
    }

    /// 取消任务：非终态皆可，任务从所有集合移除，不可逆
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        // 还在待调度队列：直接摘除
        let queued = {
            let mut pending = self.pending.lock().await;
            pending
                .iter()
                .position(|h| h.id == task_id)
                .and_then(|index| pending.remove(index))
        };
        if let Some(handle) = queued {
            let old_status = {
                let mut task = handle.task.lock().await;
                let old = task.status.as_str();
                task.mark_cancelled();
                old
            };
            handle.cancel_run();
            self.progress_store.remove(task_id).await;
            self.emit_cancelled(task_id, old_status);
            self.emit_queue_changed().await;
            return Ok(());
        }

        // 运行中：置取消态并中断，settle 时从 active 移除
        if let Some(handle) = self.active.get(task_id).map(|e| Arc::clone(e.value())) {
            let old_status = {
                let mut task = handle.task.lock().await;
                if !task.can_cancel() {
                    anyhow::bail!("任务已结束，无法取消: {}", task_id);
                }
                let old = task.status.as_str();
                task.mark_cancelled();
                old
            };
            handle.cancel_run();
            self.progress_store.remove(task_id).await;
            self.emit_cancelled(task_id, old_status);
            return Ok(());
        }

        anyhow::bail!("任务不存在或已结束: {}", task_id)
    }

    fn emit_cancelled(&self, task_id: &str, old_status: &str) {
        info!("取消上传任务: {}", task_id);
        self.events.emit(&UploadEvent::StatusChanged {
            task_id: task_id.to_string(),
            old_status: old_status.to_string(),
            new_status: TaskStatus::Cancelled.as_str().to_string(),
        });
        self.events.emit(&UploadEvent::Cancelled {
            task_id: task_id.to_string(),
        });
    }

    /// 重试失败的任务：重置后回到待调度队列
    pub async fn retry_task(&self, task_id: &str) -> Result<()> {
        let handle = {
            let completed = self.completed.lock().await;
            completed.iter().find(|h| h.id == task_id).cloned()
        }
        .ok_or_else(|| anyhow::anyhow!("任务不在已结束列表: {}", task_id))?;

        {
            let mut task = handle.task.lock().await;
            if task.status != TaskStatus::Error {
                anyhow::bail!("只有失败任务可以重试: {}", task_id);
            }
            task.reset_for_retry();
        }
        handle.chunks.lock().await.reset();
        handle.speed.reset();
        handle.eta.reset();
        handle.set_paused(false);

        {
            let mut completed = self.completed.lock().await;
            completed.retain(|h| h.id != task_id);
        }
        info!("重试上传任务: {}", task_id);
        self.events.emit(&UploadEvent::StatusChanged {
            task_id: task_id.to_string(),
            old_status: TaskStatus::Error.as_str().to_string(),
            new_status: TaskStatus::Pending.as_str().to_string(),
        });
        self.enqueue(handle).await;
        self.emit_queue_changed().await;
        self.schedule().await;
        Ok(())
    }

    /// 移除任务：运行中的先取消，再从所有集合与持久化中清理
    pub async fn remove_task(&self, task_id: &str) -> Result<()> {
        // 非终态先取消（忽略已结束的报错）
        let _ = self.cancel_task(task_id).await;

        {
            let mut pending = self.pending.lock().await;
            pending.retain(|h| h.id != task_id);
        }
        self.active.remove(task_id);
        {
            let mut completed = self.completed.lock().await;
            completed.retain(|h| h.id != task_id);
        }
        self.progress_store.remove(task_id).await;

        info!("移除上传任务: {}", task_id);
        self.emit_queue_changed().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // 批量操作
    // ------------------------------------------------------------------

    /// 暂停全部任务并置全局暂停标记
    pub async fn pause_all(&self) {
        self.global_paused.store(true, Ordering::SeqCst);
        let ids = self.collect_ids(|status| {
            matches!(status, TaskStatus::Pending | TaskStatus::Uploading)
        })
        .await;
        let results = join_all(ids.iter().map(|id| self.pause_task(id))).await;
        for (task_id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!("暂停任务失败: {}, {}", task_id, e);
            }
        }
        info!("⏸ 已暂停全部任务: {} 个", ids.len());
    }

    /// 清除全局暂停标记并恢复全部暂停任务
    pub async fn resume_all(&self) {
        self.global_paused.store(false, Ordering::SeqCst);
        let ids = self
            .collect_ids(|status| status == TaskStatus::Paused)
            .await;
        let results = join_all(ids.iter().map(|id| self.resume_task(id))).await;
        for (task_id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!("恢复任务失败: {}, {}", task_id, e);
            }
        }
        info!("▶ 已恢复全部任务: {} 个", ids.len());
        self.schedule().await;
    }

    /// 取消全部未结束任务
    pub async fn cancel_all(&self) {
        self.global_paused.store(false, Ordering::SeqCst);
        let ids = self.collect_ids(|status| !status.is_terminal()).await;
        let results = join_all(ids.iter().map(|id| self.cancel_task(id))).await;
        for (task_id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!("取消任务失败: {}, {}", task_id, e);
            }
        }
        info!("已取消全部任务: {} 个", ids.len());
    }

    /// 清除已成功的任务，返回清除数量
    pub async fn clear_completed(&self) -> usize {
        let removed = self.drain_completed(TaskStatus::Success).await;
        info!("清除 {} 个已完成任务", removed);
        self.emit_queue_changed().await;
        removed
    }

    /// 清除失败的任务，返回清除数量
    pub async fn clear_failed(&self) -> usize {
        let removed = self.drain_completed(TaskStatus::Error).await;
        info!("清除 {} 个失败任务", removed);
        self.emit_queue_changed().await;
        removed
    }

    async fn drain_completed(&self, target: TaskStatus) -> usize {
        let handles: Vec<Arc<TaskHandle>> = {
            let completed = self.completed.lock().await;
            completed.iter().cloned().collect()
        };
        let mut to_remove = Vec::new();
        for handle in handles {
            if handle.status().await == target {
                to_remove.push(handle.id.clone());
            }
        }
        let mut completed = self.completed.lock().await;
        let before = completed.len();
        completed.retain(|h| !to_remove.contains(&h.id));
        before - completed.len()
    }

    // ------------------------------------------------------------------
    // 动态调参
    // ------------------------------------------------------------------

    /// 运行期重试预算生效后的配置视图
    fn effective_config(&self) -> Arc<UploaderConfig> {
        let max_retries = self.max_retries.load(Ordering::SeqCst);
        if max_retries == self.config.retry.max_retries {
            Arc::clone(&self.config)
        } else {
            let mut adjusted = (*self.config).clone();
            adjusted.retry.max_retries = max_retries;
            Arc::new(adjusted)
        }
    }

    /// 调整最大并发文件数，立即生效并尝试补位
    pub async fn update_max_concurrent_files(&self, max_files: usize) {
        let max_files = max_files.max(1);
        self.declared_files.store(max_files, Ordering::SeqCst);
        self.tuner
            .set_declared(max_files, self.declared_chunks.load(Ordering::SeqCst));
        info!("🔧 调整最大并发文件数: {}", max_files);
        self.reset_speed_windows();
        self.schedule().await;
    }

    /// 调整单任务最大并发分片数（对新启动的任务生效）
    pub fn update_max_concurrent_chunks(&self, max_chunks: usize) {
        let max_chunks = max_chunks.max(1);
        self.declared_chunks.store(max_chunks, Ordering::SeqCst);
        self.tuner
            .set_declared(self.declared_files.load(Ordering::SeqCst), max_chunks);
        info!("🔧 调整最大并发分片数: {}", max_chunks);
        self.reset_speed_windows();
    }

    /// 调整分片重试预算（对新启动的任务生效）
    pub fn update_max_retries(&self, max_retries: u32) {
        self.max_retries.store(max_retries, Ordering::SeqCst);
        info!("🔧 调整分片重试预算: {}", max_retries);
    }

    /// 并发调整后带宽重新分配，旧的速度样本失真
    fn reset_speed_windows(&self) {
        self.global_speed.reset();
        for entry in self.active.iter() {
            entry.value().speed.reset();
        }
    }

    // ------------------------------------------------------------------
    // 查询
    // ------------------------------------------------------------------

    /// 任务快照
    pub async fn get_task(&self, task_id: &str) -> Option<UploadTask> {
        let handle = self.find_handle(task_id).await?;
        Some(handle.snapshot().await)
    }

    /// 全部任务快照，按创建时间倒序
    pub async fn get_all_tasks(&self) -> Vec<UploadTask> {
        let handles = self.all_handles().await;
        let mut tasks = Vec::with_capacity(handles.len());
        for handle in handles {
            tasks.push(handle.snapshot().await);
        }
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// 聚合统计
    pub async fn get_stats(&self) -> UploadStats {
        let mut stats = UploadStats::default();
        let handles = self.all_handles().await;
        for handle in &handles {
            let task = handle.task.lock().await;
            match task.status {
                TaskStatus::Pending => stats.pending_count += 1,
                TaskStatus::Uploading => {
                    stats.active_count += 1;
                    stats.current_speed += task.speed;
                }
                TaskStatus::Paused => stats.paused_count += 1,
                TaskStatus::Success => stats.success_count += 1,
                TaskStatus::Error => stats.error_count += 1,
                TaskStatus::Cancelled => {}
            }
            stats.total_bytes += task.file_size;
            stats.uploaded_bytes += task.uploaded_size;
        }
        if stats.total_bytes > 0 {
            stats.overall_progress =
                (stats.uploaded_bytes as f64 / stats.total_bytes as f64) * 100.0;
        }
        stats.average_speed = self.global_speed.average_speed();
        stats.eta_secs = self.global_eta.estimate(
            stats.total_bytes.saturating_sub(stats.uploaded_bytes),
            stats.current_speed,
        );
        stats.network_quality = self.tuner.quality(stats.current_speed).as_str().to_string();
        stats
    }

    /// 活跃任务数
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    async fn task_count(&self) -> usize {
        let pending = self.pending.lock().await.len();
        let completed = self.completed.lock().await.len();
        pending + self.active.len() + completed
    }

    async fn find_handle(&self, task_id: &str) -> Option<Arc<TaskHandle>> {
        if let Some(entry) = self.active.get(task_id) {
            return Some(Arc::clone(entry.value()));
        }
        {
            let pending = self.pending.lock().await;
            if let Some(handle) = pending.iter().find(|h| h.id == task_id) {
                return Some(Arc::clone(handle));
            }
        }
        let completed = self.completed.lock().await;
        completed.iter().find(|h| h.id == task_id).cloned()
    }

    async fn all_handles(&self) -> Vec<Arc<TaskHandle>> {
        let mut handles = Vec::new();
        {
            let pending = self.pending.lock().await;
            handles.extend(pending.iter().cloned());
        }
        for entry in self.active.iter() {
            handles.push(Arc::clone(entry.value()));
        }
        {
            let completed = self.completed.lock().await;
            handles.extend(completed.iter().cloned());
        }
        handles
    }

    async fn collect_ids(&self, filter: impl Fn(TaskStatus) -> bool) -> Vec<String> {
        let handles = self.all_handles().await;
        let mut ids = Vec::new();
        for handle in handles {
            if filter(handle.status().await) {
                ids.push(handle.id.clone());
            }
        }
        ids
    }

    // ------------------------------------------------------------------
    // 恢复
    // ------------------------------------------------------------------

    /// 从磁盘恢复未完成任务（暂停状态停放，需手动恢复）
    ///
    /// 快照与当前文件名/大小不符时作废，源文件消失时同样丢弃
    pub async fn restore_tasks(&self) -> usize {
        if !(self.config.features.enable_resume && self.config.features.enable_cache) {
            return 0;
        }
        let snapshots = self.progress_store.list_from_disk().await;
        let mut restored = 0;

        for snapshot in snapshots {
            if self.find_handle(&snapshot.task_id).await.is_some() {
                continue;
            }
            let metadata = match tokio::fs::metadata(&snapshot.file_path).await {
                Ok(m) => m,
                Err(_) => {
                    warn!("续传源文件不存在，丢弃快照: {:?}", snapshot.file_path);
                    self.progress_store.remove(&snapshot.task_id).await;
                    continue;
                }
            };
            let current_name = snapshot
                .file_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if !snapshot.matches_file(&current_name, metadata.len()) {
                warn!("续传快照与当前文件不符，丢弃: {:?}", snapshot.file_path);
                self.progress_store.remove(&snapshot.task_id).await;
                continue;
            }

            let mut task = UploadTask::new(
                snapshot.file_path.clone(),
                snapshot.file_name.clone(),
                snapshot.file_size,
            );
            task.id = snapshot.task_id.clone();
            task.status = TaskStatus::Paused;
            task.file_md5 = snapshot.file_md5.clone();

            let handle = TaskHandle::new(task, snapshot.chunk_size);
            {
                let mut chunks = handle.chunks.lock().await;
                let count = chunks.restore_from_snapshot(&snapshot.completed_chunks);
                let uploaded = chunks.uploaded_bytes();
                let total = chunks.chunk_count();
                drop(chunks);

                let mut task = handle.task.lock().await;
                task.total_chunks = total;
                task.update_progress(count, uploaded);
            }
            handle.set_paused(true);

            info!(
                "🔄 恢复上传任务: id={}, file={}, 已完成 {}/{} 分片",
                handle.id,
                snapshot.file_name,
                snapshot.completed_chunks.len(),
                snapshot.total_chunks
            );
            self.pending.lock().await.push_back(handle);
            restored += 1;
        }

        if restored > 0 {
            info!("恢复 {} 个未完成的上传任务（暂停状态）", restored);
            self.emit_queue_changed().await;
        }
        restored
    }

    // ------------------------------------------------------------------
    // 聚合事件
    // ------------------------------------------------------------------

    async fn emit_queue_changed(&self) {
        let pending = self.pending.lock().await.len();
        let completed = self.completed.lock().await.len();
        self.events.emit(&UploadEvent::QueueChanged {
            pending,
            active: self.active.len(),
            completed,
        });
    }

    async fn emit_total_progress(&self, force: bool) {
        let handles = self.all_handles().await;
        if handles.is_empty() {
            return;
        }
        let mut uploaded = 0u64;
        let mut total = 0u64;
        let mut speed = 0u64;
        for handle in &handles {
            let task = handle.task.lock().await;
            uploaded += task.uploaded_size;
            total += task.file_size;
            if task.status == TaskStatus::Uploading {
                speed += task.speed;
            }
        }
        let pass = if force {
            self.aggregate_throttler.force_emit()
        } else {
            self.aggregate_throttler.should_emit()
        };
        if pass {
            let progress = if total > 0 {
                (uploaded as f64 / total as f64) * 100.0
            } else {
                0.0
            };
            self.events.emit(&UploadEvent::TotalProgress {
                uploaded_size: uploaded,
                total_size: total,
                progress,
                speed,
            });
        }
    }

    /// 监控循环：每秒采样聚合速度，驱动速度事件与自适应调参
    fn spawn_monitor(manager: &Arc<Self>) {
        let weak = Arc::downgrade(manager);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            let mut last_uploaded: u64 = 0;
            let mut last_tick = Instant::now();

            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else { break };

                let handles = manager.all_handles().await;
                let mut uploaded = 0u64;
                let mut speed = 0u64;
                let mut any_active = false;
                for handle in &handles {
                    let task = handle.task.lock().await;
                    uploaded += task.uploaded_size;
                    if task.status == TaskStatus::Uploading {
                        speed += task.speed;
                        any_active = true;
                    }
                }

                let elapsed_ms = last_tick.elapsed().as_millis() as u64;
                if any_active && uploaded >= last_uploaded && elapsed_ms > 0 {
                    manager
                        .global_speed
                        .record(uploaded - last_uploaded, elapsed_ms);
                }
                last_uploaded = uploaded;
                last_tick = Instant::now();

                if any_active {
                    manager.emit_total_progress(false).await;
                    let quality = manager.tuner.quality(speed);
                    manager.events.emit(&UploadEvent::SpeedChanged {
                        speed,
                        average_speed: manager.global_speed.average_speed(),
                        quality: quality.as_str().to_string(),
                    });
                    let _ = manager.tuner.observe(speed, manager.active.len());
                }
            }
        });
    }
}
