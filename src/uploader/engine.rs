// 上传引擎：驱动单个任务的完整流水线
//
// 流程：状态预检 → 秒传检查 → 分片准备（含续传恢复）→ 并发分片上传 →
// 失败判定 → 合并 → 终态落账。暂停与取消共用运行令牌中断，
// 区别在收尾：暂停持久化进度快照，取消清理一切。
//
// 并发模型：Semaphore 限制单任务内分片并发，JoinSet 统一回收；
// 每个分片持有运行令牌的 child_token，令牌取消后在途请求立即中断。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CachedProgressData, DedupCache, DedupRecord, ProgressCacheStore};
use crate::config::{RetryConfig, UploaderConfig};
use crate::error::{ErrorContext, UploadError};
use crate::events::{CallbackManager, ProgressThrottler, UploadEvent};
use crate::uploader::chunk::{self, UploadChunkManager};
use crate::uploader::client::{CheckRequest, ChunkClient, ChunkRequest, MergeRequest};
use crate::uploader::hasher::FileHasher;
use crate::uploader::speed::{SpeedCalculator, TimeEstimator};
use crate::uploader::task::{TaskStatus, UploadTask};

/// 一轮上传的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// 全部分片合并完成（或秒传命中）
    Success,
    /// 有分片耗尽重试预算或合并失败
    Failed,
    /// 被暂停打断，任务回到待调度队列停放
    Paused,
    /// 被取消，任务将从队列移除
    Cancelled,
}

/// 任务运行句柄
///
/// 聚合单个任务的全部共享状态，调度器持有 Arc 在
/// 待调度/活跃/已结束集合之间迁移。id/priority/file_size
/// 是创建后不变的字段，直接暴露以便排序时免锁访问。
pub struct TaskHandle {
    pub id: String,
    pub priority: i32,
    pub file_size: u64,
    /// 任务元数据与状态
    pub task: Arc<Mutex<UploadTask>>,
    /// 分片管理器
    pub chunks: Arc<Mutex<UploadChunkManager>>,
    /// 本任务的速度采样窗口
    pub speed: Arc<SpeedCalculator>,
    /// 本任务的剩余时间估算
    pub eta: Arc<TimeEstimator>,
    /// 进度事件节流器
    pub throttler: ProgressThrottler,
    /// 当前运行令牌，每轮启动前换新
    run_token: parking_lot::Mutex<CancellationToken>,
    /// 暂停请求标记，引擎在安全点检查
    pause_flag: AtomicBool,
}

impl TaskHandle {
    pub fn new(task: UploadTask, chunk_size: u64) -> Arc<Self> {
        let chunks = UploadChunkManager::new(task.file_size, chunk_size);
        Arc::new(Self {
            id: task.id.clone(),
            priority: task.options.priority,
            file_size: task.file_size,
            task: Arc::new(Mutex::new(task)),
            chunks: Arc::new(Mutex::new(chunks)),
            speed: Arc::new(SpeedCalculator::new()),
            eta: Arc::new(TimeEstimator::new()),
            throttler: ProgressThrottler::default(),
            run_token: parking_lot::Mutex::new(CancellationToken::new()),
            pause_flag: AtomicBool::new(false),
        })
    }

    /// 当前运行令牌
    pub fn run_token(&self) -> CancellationToken {
        self.run_token.lock().clone()
    }

    /// 换新运行令牌，旧令牌上挂着的分片不受新一轮影响
    pub fn renew_run_token(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        *self.run_token.lock() = fresh.clone();
        fresh
    }

    /// 中断当前运行（暂停与取消共用）
    pub fn cancel_run(&self) {
        self.run_token.lock().cancel();
    }

    pub fn set_paused(&self, paused: bool) {
        self.pause_flag.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.pause_flag.load(Ordering::SeqCst)
    }

    /// 任务数据快照
    pub async fn snapshot(&self) -> UploadTask {
        self.task.lock().await.clone()
    }

    pub async fn status(&self) -> TaskStatus {
        self.task.lock().await.status
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("file_size", &self.file_size)
            .finish()
    }
}

/// 计算指数退避延迟（毫秒）
///
/// 第 n 次重试等待 base * multiplier^n，封顶后叠加
/// 最多 jitter_ratio 比例的随机抖动，避免多分片同步重试
pub(crate) fn calculate_backoff_delay(retry_exponent: u32, retry: &RetryConfig) -> u64 {
    let factor = retry
        .backoff_multiplier
        .max(1.0)
        .powi(retry_exponent.min(30) as i32);
    let capped = (retry.base_delay_ms as f64 * factor).min(retry.max_delay_ms as f64);
    let delay = capped as u64;
    let jitter_cap = (capped * retry.jitter_ratio.clamp(0.0, 1.0)) as u64;
    if jitter_cap > 0 {
        use rand::Rng;
        delay + rand::thread_rng().gen_range(0..=jitter_cap)
    } else {
        delay
    }
}

/// 分片请求共用的任务元数据
#[derive(Debug, Clone)]
struct ChunkTaskMeta {
    task_id: String,
    file_name: String,
    file_path: PathBuf,
    file_size: u64,
    file_md5: Option<String>,
    total_chunks: usize,
    params: HashMap<String, String>,
}

/// 单任务上传引擎
pub struct UploadEngine {
    handle: Arc<TaskHandle>,
    client: ChunkClient,
    config: Arc<UploaderConfig>,
    events: Arc<CallbackManager>,
    dedup: Arc<DedupCache>,
    progress_store: Arc<ProgressCacheStore>,
    /// 本轮分片并发上限（自适应调节后的值）
    chunk_limit: usize,
}

impl UploadEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: Arc<TaskHandle>,
        client: ChunkClient,
        config: Arc<UploaderConfig>,
        events: Arc<CallbackManager>,
        dedup: Arc<DedupCache>,
        progress_store: Arc<ProgressCacheStore>,
        chunk_limit: usize,
    ) -> Self {
        Self {
            handle,
            client,
            config,
            events,
            dedup,
            progress_store,
            chunk_limit,
        }
    }

    /// 跑完一轮上传并返回结束方式
    pub async fn run(self) -> RunOutcome {
        let token = self.handle.run_token();
        let outcome = self.run_inner(&token).await;

        // 收尾释放分片缓冲。暂停且开启缓存时保留未完成分片的数据，
        // 恢复后免重读磁盘；其余结局全部释放
        {
            let mut chunks = self.handle.chunks.lock().await;
            if outcome == RunOutcome::Paused && self.config.features.enable_cache {
                chunks.release_completed_buffers();
            } else {
                chunks.release_all_buffers();
            }
        }
        outcome
    }

    async fn run_inner(&self, token: &CancellationToken) -> RunOutcome {
        // 1. 预检：启动前就被暂停/取消的任务不做任何事
        let (path, file_name, total_size, custom_params, old_status) = {
            let task = self.handle.task.lock().await;
            if task.status == TaskStatus::Cancelled {
                return RunOutcome::Cancelled;
            }
            (
                task.file_path.clone(),
                task.file_name.clone(),
                task.file_size,
                task.options.custom_params.clone(),
                task.status.as_str(),
            )
        };
        if self.handle.is_paused() || token.is_cancelled() {
            return RunOutcome::Paused;
        }
        let task_id = self.handle.id.clone();

        info!(
            "开始上传: task={}, file={}, size={}",
            task_id, file_name, total_size
        );

        // 2. 进入上传态
        {
            let mut task = self.handle.task.lock().await;
            task.mark_uploading();
        }
        self.emit_status_changed(&task_id, old_status, TaskStatus::Uploading.as_str());
        self.events.emit(&UploadEvent::Started {
            task_id: task_id.clone(),
        });

        // 请求参数：全局配置打底，任务级覆盖
        let mut params = self.config.request.params.clone();
        params.extend(custom_params);

        // 3. 秒传检查：本地缓存 → 服务端检查端点，任一命中直接完成
        let mut dedup_identity: Option<String> = None;
        if self.config.features.enable_dedup {
            let identity = self.resolve_identity(&path, &file_name).await;
            if let Some(file_url) = self
                .try_dedup(&identity, total_size, &file_name, &params)
                .await
            {
                return self
                    .finish_success(&task_id, &file_name, file_url, Some(&identity), true)
                    .await;
            }
            dedup_identity = Some(identity);
        }

        // 秒传检查（含哈希）期间可能被暂停/取消
        if let Some(outcome) = self.check_interruption(token).await {
            if outcome == RunOutcome::Paused {
                self.persist_progress(&task_id).await;
            }
            return outcome;
        }

        // 4. 分片准备：对齐文件现状，再恢复持久化的续传进度
        {
            let mut chunks = self.handle.chunks.lock().await;
            chunks.refresh();
            if self.config.features.enable_resume && self.config.features.enable_cache {
                if let Some(saved) = self.progress_store.load(&task_id).await {
                    if saved.matches_file(&file_name, total_size)
                        && saved.chunk_size == chunks.chunk_size()
                    {
                        let restored = chunks.restore_from_snapshot(&saved.completed_chunks);
                        if restored > 0 {
                            info!(
                                "🔄 恢复续传进度: task={}, 已完成 {}/{} 个分片",
                                task_id,
                                restored,
                                chunks.chunk_count()
                            );
                        }
                    } else {
                        warn!("续传快照与当前文件不符，丢弃: task={}", task_id);
                        self.progress_store.remove(&task_id).await;
                    }
                }
            }
        }
        emit_progress_event(&self.handle, &self.events, &task_id, false).await;

        let (total_chunks, pending, file_md5) = {
            let chunks = self.handle.chunks.lock().await;
            let pending = chunks.pending_indices();
            let total = chunks.chunk_count();
            drop(chunks);
            let md5 = self.handle.task.lock().await.file_md5.clone();
            (total, pending, md5)
        };

        // 5. 并发上传未完成分片
        let attempted = pending.len();
        let mut failed_chunks = 0usize;
        let mut first_error: Option<UploadError> = None;

        if !pending.is_empty() {
            let semaphore = Arc::new(Semaphore::new(self.chunk_limit.max(1)));
            let mut join_set: JoinSet<Result<usize, UploadError>> = JoinSet::new();
            let meta = ChunkTaskMeta {
                task_id: task_id.clone(),
                file_name: file_name.clone(),
                file_path: path.clone(),
                file_size: total_size,
                file_md5,
                total_chunks,
                params: params.clone(),
            };

            for index in pending {
                if token.is_cancelled() || self.handle.is_paused() {
                    break;
                }

                // 在等许可时被取消也要立即停止派发
                let permit = tokio::select! {
                    _ = token.cancelled() => break,
                    acquired = Arc::clone(&semaphore).acquire_owned() => match acquired {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let handle = Arc::clone(&self.handle);
                let client = self.client.clone();
                let events = Arc::clone(&self.events);
                let retry_cfg = self.config.retry.clone();
                let smart_retry = self.config.features.smart_retry;
                let keep_buffer =
                    self.config.features.enable_resume && self.config.features.enable_cache;
                let chunk_token = token.child_token();
                let meta = meta.clone();

                join_set.spawn(async move {
                    let result = upload_single_chunk(
                        index,
                        meta,
                        handle,
                        client,
                        events,
                        chunk_token,
                        retry_cfg,
                        smart_retry,
                        keep_buffer,
                    )
                    .await;
                    drop(permit);
                    result.map(|_| index)
                });
            }

            // 排干全部分片任务；中断（Abort）不算失败
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) if e.is_abort() => {
                        debug!("分片被中断: task={}", task_id);
                    }
                    Ok(Err(e)) => {
                        failed_chunks += 1;
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                    Err(join_error) => {
                        error!("分片任务异常退出: task={}, {}", task_id, join_error);
                        failed_chunks += 1;
                        if first_error.is_none() {
                            first_error = Some(UploadError::Unknown {
                                message: format!("分片任务异常退出: {}", join_error),
                                context: ErrorContext::for_task(&task_id),
                            });
                        }
                    }
                }
            }

            // 被中断的分片回到待上传，保留重试计数
            self.handle.chunks.lock().await.reset_interrupted();
        }

        emit_progress_event(&self.handle, &self.events, &task_id, false).await;

        // 6. 中断收尾：暂停保进度，取消清一切
        if let Some(outcome) = self.check_interruption(token).await {
            if outcome == RunOutcome::Paused {
                self.persist_progress(&task_id).await;
                info!("任务已暂停: task={}", task_id);
            }
            return outcome;
        }

        // 7. 失败判定：只有本轮尝试的分片全部失败（或所有分片都处于
        // 失败态）才在合并前判死；部分失败仍发起合并，由服务端裁决
        let total_failed = self.handle.chunks.lock().await.failed_count();
        let all_attempted_failed = attempted > 0 && failed_chunks == attempted;
        let every_chunk_failed = total_chunks > 0 && total_failed == total_chunks;
        if all_attempted_failed || every_chunk_failed {
            let error = first_error.unwrap_or_else(|| UploadError::Unknown {
                message: "分片上传失败".to_string(),
                context: ErrorContext::for_task(&task_id),
            });
            let detail = format!(
                "所有分片上传失败（共 {} 个）: {}",
                attempted.max(total_failed),
                error
            );
            return self.fail_task(&task_id, error, detail).await;
        }
        if failed_chunks > 0 {
            warn!(
                "{}/{} 个分片上传失败，仍尝试合并: task={}",
                failed_chunks, attempted, task_id
            );
        }

        // 8. 全部分片就绪，请求服务端合并
        let merge_request = {
            let chunks = self.handle.chunks.lock().await;
            let completed = chunks.completed_snapshot();
            drop(chunks);
            let task = self.handle.task.lock().await;
            MergeRequest {
                task_id: task_id.clone(),
                file_name: file_name.clone(),
                file_size: total_size,
                file_md5: task.file_md5.clone(),
                total_chunks,
                chunks: completed,
                params: params.clone(),
            }
        };

        match self.client.merge_chunks(&merge_request).await {
            Ok(response) => {
                self.finish_success(
                    &task_id,
                    &file_name,
                    response.file_url,
                    dedup_identity.as_deref(),
                    false,
                )
                .await
            }
            Err(e) => {
                let detail = format!("合并分片失败: {}", e);
                self.fail_task(&task_id, e, detail).await
            }
        }
    }

    /// 运行中断检查
    ///
    /// 任务状态为 CANCELLED 才算取消；其余中断（含暂停后又恢复导致的
    /// 令牌取消）一律按暂停收尾，任务停回队列等待重新调度
    async fn check_interruption(&self, token: &CancellationToken) -> Option<RunOutcome> {
        if !token.is_cancelled() && !self.handle.is_paused() {
            return None;
        }
        if self.handle.status().await == TaskStatus::Cancelled {
            return Some(RunOutcome::Cancelled);
        }
        Some(RunOutcome::Paused)
    }

    /// 去重标识：启用哈希时为文件 MD5，否则退回文件名
    async fn resolve_identity(&self, path: &Path, file_name: &str) -> String {
        if !self.config.features.hash_in_worker {
            return file_name.to_string();
        }
        match FileHasher::md5_file(path).await {
            Ok(md5) => {
                self.handle.task.lock().await.file_md5 = Some(md5.clone());
                md5
            }
            Err(e) => {
                warn!("MD5 计算失败，退回文件名标识: {}", e);
                file_name.to_string()
            }
        }
    }

    /// 秒传检查，命中返回 Some(已有文件地址)
    ///
    /// 检查端点请求失败按未命中处理，不阻断常规上传
    async fn try_dedup(
        &self,
        identity: &str,
        file_size: u64,
        file_name: &str,
        params: &HashMap<String, String>,
    ) -> Option<Option<String>> {
        if let Some(record) = self.dedup.check(identity, file_size, file_name) {
            info!("✓ 秒传命中（本地缓存）: {}", file_name);
            return Some(record.file_url);
        }

        let request = CheckRequest {
            file_name: file_name.to_string(),
            file_size,
            identity: identity.to_string(),
            params: params.clone(),
        };
        match self.client.check_file(&request).await {
            Ok(Some(response)) if response.exists => {
                info!("✓ 秒传命中（服务端）: {}", file_name);
                Some(response.file_url)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("秒传检查失败，继续常规上传: {}", e);
                None
            }
        }
    }

    /// 成功收尾：落账、记秒传缓存、清续传快照、发事件
    async fn finish_success(
        &self,
        task_id: &str,
        file_name: &str,
        file_url: Option<String>,
        dedup_identity: Option<&str>,
        is_dedup_hit: bool,
    ) -> RunOutcome {
        // 终态进度从任务自身取值：秒传命中没有分片计数可算
        let (completed_at, final_progress) = {
            let mut task = self.handle.task.lock().await;
            task.is_dedup_hit = is_dedup_hit;
            task.mark_success(file_url.clone());
            let progress = UploadEvent::Progress {
                task_id: task_id.to_string(),
                uploaded_size: task.uploaded_size,
                total_size: task.file_size,
                progress: task.progress as f64,
                speed: task.speed,
                completed_chunks: task.completed_chunks,
                total_chunks: task.total_chunks,
            };
            (
                task.completed_at.unwrap_or_else(|| chrono::Utc::now().timestamp()),
                progress,
            )
        };

        if let Some(identity) = dedup_identity {
            self.dedup.record(
                identity,
                self.handle.file_size,
                DedupRecord {
                    file_name: file_name.to_string(),
                    file_size: self.handle.file_size,
                    file_url: file_url.clone(),
                    uploaded_at: chrono::Utc::now().timestamp(),
                },
            );
        }

        self.progress_store.remove(task_id).await;

        self.handle.throttler.force_emit();
        self.events.emit(&final_progress);
        self.emit_status_changed(
            task_id,
            TaskStatus::Uploading.as_str(),
            TaskStatus::Success.as_str(),
        );
        self.events.emit(&UploadEvent::Completed {
            task_id: task_id.to_string(),
            file_name: file_name.to_string(),
            file_url,
            completed_at,
        });

        if is_dedup_hit {
            info!("✓ 秒传完成: {}", file_name);
        } else {
            info!("✓ 上传完成: {}", file_name);
        }
        RunOutcome::Success
    }

    /// 失败收尾：落账、清续传快照、发事件
    async fn fail_task(
        &self,
        task_id: &str,
        error: UploadError,
        detail: String,
    ) -> RunOutcome {
        error!("任务失败: task={}, {}", task_id, error.to_log_value());
        {
            let mut task = self.handle.task.lock().await;
            task.mark_failed(detail.clone());
        }
        self.progress_store.remove(task_id).await;

        self.emit_status_changed(
            task_id,
            TaskStatus::Uploading.as_str(),
            TaskStatus::Error.as_str(),
        );
        self.events.emit(&UploadEvent::Failed {
            task_id: task_id.to_string(),
            error: detail,
            user_message: error.user_message(),
        });
        RunOutcome::Failed
    }

    /// 持久化续传进度快照（暂停收尾时调用）
    async fn persist_progress(&self, task_id: &str) {
        if !(self.config.features.enable_resume && self.config.features.enable_cache) {
            return;
        }
        let (completed_chunks, chunk_size, total_chunks) = {
            let chunks = self.handle.chunks.lock().await;
            (
                chunks.completed_snapshot(),
                chunks.chunk_size(),
                chunks.chunk_count(),
            )
        };
        let data = {
            let task = self.handle.task.lock().await;
            CachedProgressData {
                task_id: task_id.to_string(),
                file_path: task.file_path.clone(),
                file_name: task.file_name.clone(),
                file_size: task.file_size,
                file_md5: task.file_md5.clone(),
                chunk_size,
                total_chunks,
                completed_chunks,
                saved_at: chrono::Utc::now().timestamp(),
            }
        };
        self.progress_store.save(&data).await;
    }

    fn emit_status_changed(&self, task_id: &str, old_status: &str, new_status: &str) {
        self.events.emit(&UploadEvent::StatusChanged {
            task_id: task_id.to_string(),
            old_status: old_status.to_string(),
            new_status: new_status.to_string(),
        });
    }
}

/// 刷新任务聚合计数并（节流地）发出进度事件
///
/// force 为 true 时跳过节流，终态前的最后一次进度必须送达
async fn emit_progress_event(
    handle: &Arc<TaskHandle>,
    events: &CallbackManager,
    task_id: &str,
    force: bool,
) {
    let (uploaded, total, progress, speed, completed, total_chunks) = {
        let (completed, uploaded, total_chunks) = {
            let chunks = handle.chunks.lock().await;
            (
                chunks.completed_count(),
                chunks.uploaded_bytes(),
                chunks.chunk_count(),
            )
        };
        let speed = handle.speed.current_speed();
        let mut task = handle.task.lock().await;
        task.total_chunks = total_chunks;
        task.update_progress(completed, uploaded);
        task.speed = speed;
        (
            uploaded,
            task.file_size,
            task.progress as f64,
            speed,
            completed,
            total_chunks,
        )
    };

    let pass = if force {
        handle.throttler.force_emit()
    } else {
        handle.throttler.should_emit()
    };
    if pass {
        events.emit(&UploadEvent::Progress {
            task_id: task_id.to_string(),
            uploaded_size: uploaded,
            total_size: total,
            progress,
            speed,
            completed_chunks: completed,
            total_chunks,
        });
    }
}

/// 上传单个分片（含重试循环）
///
/// 重试预算按分片累计：跨暂停/恢复不清零，只有任务级重试才重置。
/// 返回 Abort 表示被暂停/取消中断，调用方不计入失败。
#[allow(clippy::too_many_arguments)]
async fn upload_single_chunk(
    index: usize,
    meta: ChunkTaskMeta,
    handle: Arc<TaskHandle>,
    client: ChunkClient,
    events: Arc<CallbackManager>,
    chunk_token: CancellationToken,
    retry_cfg: RetryConfig,
    smart_retry: bool,
    keep_buffer: bool,
) -> Result<(), UploadError> {
    let context = || ErrorContext::for_task(&meta.task_id).with_chunk(index);

    if chunk_token.is_cancelled() {
        return Err(UploadError::abort(context()));
    }

    // 取区间与缓存数据；锁内不做磁盘 IO
    let (start, end, cached) = {
        let mut chunks = handle.chunks.lock().await;
        let Some((start, end)) = chunks.chunk_range(index) else {
            return Err(UploadError::Unknown {
                message: format!("分片 {} 不存在", index),
                context: context(),
            });
        };
        chunks.mark_uploading(index);
        (start, end, chunks.take_cached_data(index))
    };

    let mut data = match cached {
        Some(data) => {
            debug!("分片使用缓存数据: task={}, chunk={}", meta.task_id, index);
            data
        }
        None => match chunk::read_chunk_data(&meta.file_path, start, end).await {
            Ok(data) => data,
            Err(e) => {
                // 本地读失败没有重试价值
                let message = format!("读取分片数据失败: {}", e);
                handle.chunks.lock().await.mark_error(index, message.clone());
                events.emit(&UploadEvent::ChunkFailed {
                    task_id: meta.task_id.clone(),
                    chunk_index: index,
                    error: message.clone(),
                    retry_count: 0,
                });
                return Err(UploadError::Unknown {
                    message,
                    context: context(),
                });
            }
        },
    };
    let chunk_bytes = data.len() as u64;

    loop {
        if chunk_token.is_cancelled() {
            return Err(UploadError::abort(context()));
        }

        let request = ChunkRequest {
            task_id: meta.task_id.clone(),
            file_name: meta.file_name.clone(),
            file_size: meta.file_size,
            file_md5: meta.file_md5.clone(),
            chunk_index: index,
            total_chunks: meta.total_chunks,
            chunk_start: start,
            chunk_end: end,
            data: data.clone(),
            params: meta.params.clone(),
        };

        let started = Instant::now();
        let result = tokio::select! {
            _ = chunk_token.cancelled() => Err(UploadError::abort(context())),
            sent = client.upload_chunk(&request) => sent,
        };

        match result {
            Ok(response) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let rate = handle.speed.record(chunk_bytes, elapsed_ms);

                let (completed, total) = {
                    let mut chunks = handle.chunks.lock().await;
                    if keep_buffer {
                        chunks.store_data(index, std::mem::take(&mut data));
                    }
                    chunks.mark_success(index, response.etag.clone(), elapsed_ms, keep_buffer);
                    (chunks.completed_count(), chunks.chunk_count())
                };

                debug!(
                    "分片上传成功: task={}, 进度 {}/{}, 耗时 {}ms, 速率 {} KB/s",
                    meta.task_id,
                    completed,
                    total,
                    elapsed_ms,
                    rate / 1024
                );

                events.emit(&UploadEvent::ChunkCompleted {
                    task_id: meta.task_id.clone(),
                    chunk_index: index,
                    etag: response.etag,
                });
                emit_progress_event(&handle, &events, &meta.task_id, false).await;
                return Ok(());
            }
            Err(error) => {
                if error.is_abort() {
                    return Err(error);
                }

                // 智能重试只放行网络类错误；关闭时所有失败都值得再试
                let retryable = if smart_retry { error.is_retryable() } else { true };
                let retry_count = handle.chunks.lock().await.increment_retry(index);

                if !retryable || retry_count > retry_cfg.max_retries {
                    let mut error = error;
                    error.set_retry_count(retry_count);
                    let detail = error.to_string();
                    handle.chunks.lock().await.mark_error(index, detail.clone());
                    error!(
                        "分片上传失败（终止）: task={}, chunk={}, {}",
                        meta.task_id,
                        index,
                        error.to_log_value()
                    );
                    events.emit(&UploadEvent::ChunkFailed {
                        task_id: meta.task_id.clone(),
                        chunk_index: index,
                        error: detail,
                        retry_count,
                    });
                    return Err(error);
                }

                let delay_ms = calculate_backoff_delay(retry_count - 1, &retry_cfg);
                warn!(
                    "⚠️ 分片上传失败，{}ms 后重试 ({}/{}): task={}, chunk={}, {}",
                    delay_ms, retry_count, retry_cfg.max_retries, meta.task_id, index, error
                );
                tokio::select! {
                    _ = chunk_token.cancelled() => return Err(UploadError::abort(context())),
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                }
            }
        }
    }
}
