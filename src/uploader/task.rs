// 上传任务定义
//
// 任务状态机：PENDING → UPLOADING → {SUCCESS | ERROR}
//            UPLOADING → PAUSED → PENDING（恢复后回到队首）
//            任意非终态 → CANCELLED
// SUCCESS / ERROR / CANCELLED 为终态，只有任务级重试能把 ERROR 拉回 PENDING

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 等待调度
    Pending,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 上传成功
    Success,
    /// 上传失败
    Error,
    /// 已取消
    Cancelled,
}

impl TaskStatus {
    /// 状态名（事件载荷用）
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Paused => "paused",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 每任务可覆盖的选项
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskOptions {
    /// 调度优先级，越大越先上传
    #[serde(default)]
    pub priority: i32,
    /// 覆盖全局分片大小 (bytes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    /// 附加到每个请求的自定义参数
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_params: HashMap<String, String>,
}

/// 上传任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务ID
    pub id: String,
    /// 本地文件路径
    pub file_path: PathBuf,
    /// 文件名
    pub file_name: String,
    /// 文件大小 (bytes)
    pub file_size: u64,
    /// 任务状态
    pub status: TaskStatus,
    /// 进度百分比 (0-100)，由分片计数推导
    pub progress: u8,
    /// 已上传字节数
    pub uploaded_size: u64,
    /// 当前速度 (bytes/s)
    pub speed: u64,
    /// 总分片数
    #[serde(default)]
    pub total_chunks: usize,
    /// 已完成分片数
    #[serde(default)]
    pub completed_chunks: usize,
    /// 任务级重试次数
    #[serde(default)]
    pub retry_count: u32,
    /// 文件 MD5（哈希计算开启时填充）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_md5: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 暂停时间 (Unix timestamp)
    pub paused_at: Option<i64>,
    /// 恢复时间 (Unix timestamp)
    pub resumed_at: Option<i64>,
    /// 结束时间 (Unix timestamp)，成功/失败/取消时记录
    pub completed_at: Option<i64>,
    /// 成功后服务端返回的文件引用
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// 最近一次失败的错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 是否命中秒传（未实际传输字节）
    #[serde(default)]
    pub is_dedup_hit: bool,
    /// 任务选项
    #[serde(default)]
    pub options: TaskOptions,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(file_path: PathBuf, file_name: String, file_size: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_path,
            file_name,
            file_size,
            status: TaskStatus::Pending,
            progress: 0,
            uploaded_size: 0,
            speed: 0,
            total_chunks: 0,
            completed_chunks: 0,
            retry_count: 0,
            file_md5: None,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            paused_at: None,
            resumed_at: None,
            completed_at: None,
            file_url: None,
            error: None,
            is_dedup_hit: false,
            options: TaskOptions::default(),
        }
    }

    /// 创建带选项的任务
    pub fn new_with_options(
        file_path: PathBuf,
        file_name: String,
        file_size: u64,
        options: TaskOptions,
    ) -> Self {
        let mut task = Self::new(file_path, file_name, file_size);
        task.options = options;
        task
    }

    /// 是否允许暂停（仅 PENDING / UPLOADING）
    pub fn can_pause(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Uploading)
    }

    /// 是否允许取消（任意非终态）
    pub fn can_cancel(&self) -> bool {
        !self.status.is_terminal()
    }

    /// 按分片计数刷新进度
    pub fn update_progress(&mut self, completed_chunks: usize, uploaded_size: u64) {
        self.completed_chunks = completed_chunks;
        self.uploaded_size = uploaded_size;
        self.progress = if self.total_chunks == 0 {
            0
        } else {
            ((completed_chunks as f64 / self.total_chunks as f64) * 100.0).round() as u8
        };
    }

    /// 标记为上传中
    pub fn mark_uploading(&mut self) {
        self.status = TaskStatus::Uploading;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为暂停
    pub fn mark_paused(&mut self) {
        self.status = TaskStatus::Paused;
        self.paused_at = Some(chrono::Utc::now().timestamp());
    }

    /// 暂停恢复，回到 PENDING 等待重新调度
    pub fn mark_resumed(&mut self) {
        self.status = TaskStatus::Pending;
        self.paused_at = None;
        self.resumed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为上传成功
    pub fn mark_success(&mut self, file_url: Option<String>) {
        self.status = TaskStatus::Success;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.uploaded_size = self.file_size;
        self.completed_chunks = self.total_chunks;
        self.progress = 100;
        self.file_url = file_url;
        self.error = None;
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = TaskStatus::Error;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.error = Some(error);
    }

    /// 标记为取消
    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 任务级重试：失败任务重新排队
    ///
    /// 清空进度、时间戳和错误，重试计数 +1；分片级重试预算由分片管理器单独清零
    pub fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.progress = 0;
        self.uploaded_size = 0;
        self.completed_chunks = 0;
        self.speed = 0;
        self.retry_count += 1;
        self.started_at = None;
        self.paused_at = None;
        self.resumed_at = None;
        self.completed_at = None;
        self.error = None;
        self.file_url = None;
    }

    /// 上传耗时（秒），未开始返回 None
    pub fn elapsed_secs(&self) -> Option<i64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(|| chrono::Utc::now().timestamp());
        Some((end - started).max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(size: u64) -> UploadTask {
        UploadTask::new(PathBuf::from("/tmp/file.bin"), "file.bin".to_string(), size)
    }

    #[test]
    fn test_task_creation() {
        let task = sample_task(1024 * 1024);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.uploaded_size, 0);
        assert!(!task.id.is_empty());
        assert!(task.can_pause());
        assert!(task.can_cancel());
    }

    #[test]
    fn test_progress_rounding() {
        let mut task = sample_task(1000);
        task.total_chunks = 3;

        task.update_progress(1, 334);
        assert_eq!(task.progress, 33);

        task.update_progress(2, 667);
        assert_eq!(task.progress, 67);

        task.update_progress(3, 1000);
        assert_eq!(task.progress, 100);
    }

    #[test]
    fn test_status_transitions() {
        let mut task = sample_task(1000);

        task.mark_uploading();
        assert_eq!(task.status, TaskStatus::Uploading);
        assert!(task.started_at.is_some());

        task.mark_paused();
        assert_eq!(task.status, TaskStatus::Paused);
        assert!(task.paused_at.is_some());
        assert!(!task.can_pause());

        task.mark_resumed();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.paused_at.is_none());
        assert!(task.resumed_at.is_some());

        task.mark_uploading();
        task.mark_success(Some("http://example.com/f".to_string()));
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.progress, 100);
        assert_eq!(task.uploaded_size, task.file_size);
        assert!(task.status.is_terminal());
        assert!(!task.can_cancel());
    }

    #[test]
    fn test_failure_and_retry_reset() {
        let mut task = sample_task(1000);
        task.total_chunks = 4;
        task.mark_uploading();
        task.update_progress(2, 500);
        task.mark_failed("网络连接异常".to_string());

        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.error.is_some());
        assert!(task.completed_at.is_some());

        task.reset_for_retry();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.progress, 0);
        assert_eq!(task.uploaded_size, 0);
        assert!(task.error.is_none());
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn test_cancel_from_any_nonterminal() {
        let mut pending = sample_task(10);
        pending.mark_cancelled();
        assert_eq!(pending.status, TaskStatus::Cancelled);

        let mut paused = sample_task(10);
        paused.mark_uploading();
        paused.mark_paused();
        assert!(paused.can_cancel());
        paused.mark_cancelled();
        assert!(paused.status.is_terminal());
    }

    #[test]
    fn test_status_serde_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Uploading).unwrap();
        assert_eq!(json, "\"uploading\"");
        let back: TaskStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(back, TaskStatus::Cancelled);
    }
}
