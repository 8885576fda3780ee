// 上传事件类型定义
//
// 所有事件通过 CallbackManager 分发给订阅者；
// 低优先级事件（进度类）会被节流，高优先级事件（完成/失败）立即送达

use serde::{Deserialize, Serialize};

/// 事件优先级
///
/// 同一事件的多个订阅者按优先级降序回调；进度类事件优先级最低
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    Medium,
    High,
}

/// 上传事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 任务创建（通过校验并入队）
    Created {
        task_id: String,
        file_name: String,
        file_size: u64,
    },
    /// 任务开始上传
    Started { task_id: String },
    /// 任务进度更新
    Progress {
        task_id: String,
        uploaded_size: u64,
        total_size: u64,
        /// 进度百分比 (0.0 - 100.0)
        progress: f64,
        /// 当前速度（字节/秒）
        speed: u64,
        completed_chunks: usize,
        total_chunks: usize,
    },
    /// 任务状态变更
    StatusChanged {
        task_id: String,
        old_status: String,
        new_status: String,
    },
    /// 单分片上传成功
    ChunkCompleted {
        task_id: String,
        chunk_index: usize,
        etag: Option<String>,
    },
    /// 单分片重试耗尽后失败
    ChunkFailed {
        task_id: String,
        chunk_index: usize,
        error: String,
        retry_count: u32,
    },
    /// 任务成功（含秒传命中）
    Completed {
        task_id: String,
        file_name: String,
        /// 服务端返回的文件引用（如果有）
        file_url: Option<String>,
        completed_at: i64,
    },
    /// 任务失败
    Failed {
        task_id: String,
        error: String,
        /// 面向用户的提示语
        user_message: String,
    },
    /// 任务暂停
    Paused { task_id: String },
    /// 任务恢复
    Resumed { task_id: String },
    /// 任务取消
    Cancelled { task_id: String },
    /// 全局进度
    TotalProgress {
        uploaded_size: u64,
        total_size: u64,
        progress: f64,
        speed: u64,
    },
    /// 全局速度变化
    SpeedChanged {
        /// 当前速度（字节/秒，平滑值）
        speed: u64,
        /// 窗口平均速度（字节/秒）
        average_speed: u64,
        /// 网络质量标签
        quality: String,
    },
    /// 队列变化（任务入队/出队/迁移）
    QueueChanged {
        pending: usize,
        active: usize,
        completed: usize,
    },
    /// 全部任务完成且无失败
    AllCompleted { task_ids: Vec<String> },
    /// 全部任务结束但存在失败
    AllFailed { failed_task_ids: Vec<String> },
}

impl UploadEvent {
    /// 获取关联任务 ID（聚合事件返回 None）
    pub fn task_id(&self) -> Option<&str> {
        match self {
            UploadEvent::Created { task_id, .. }
            | UploadEvent::Started { task_id }
            | UploadEvent::Progress { task_id, .. }
            | UploadEvent::StatusChanged { task_id, .. }
            | UploadEvent::ChunkCompleted { task_id, .. }
            | UploadEvent::ChunkFailed { task_id, .. }
            | UploadEvent::Completed { task_id, .. }
            | UploadEvent::Failed { task_id, .. }
            | UploadEvent::Paused { task_id }
            | UploadEvent::Resumed { task_id }
            | UploadEvent::Cancelled { task_id } => Some(task_id),
            UploadEvent::TotalProgress { .. }
            | UploadEvent::SpeedChanged { .. }
            | UploadEvent::QueueChanged { .. }
            | UploadEvent::AllCompleted { .. }
            | UploadEvent::AllFailed { .. } => None,
        }
    }

    /// 获取事件固有优先级
    pub fn priority(&self) -> EventPriority {
        match self {
            UploadEvent::Progress { .. }
            | UploadEvent::TotalProgress { .. }
            | UploadEvent::SpeedChanged { .. }
            | UploadEvent::ChunkCompleted { .. } => EventPriority::Low,
            UploadEvent::Created { .. }
            | UploadEvent::Started { .. }
            | UploadEvent::StatusChanged { .. }
            | UploadEvent::Paused { .. }
            | UploadEvent::Resumed { .. }
            | UploadEvent::QueueChanged { .. }
            | UploadEvent::ChunkFailed { .. } => EventPriority::Medium,
            UploadEvent::Completed { .. }
            | UploadEvent::Failed { .. }
            | UploadEvent::Cancelled { .. }
            | UploadEvent::AllCompleted { .. }
            | UploadEvent::AllFailed { .. } => EventPriority::High,
        }
    }

    /// 获取事件类型名称（订阅时使用的键）
    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::Created { .. } => "created",
            UploadEvent::Started { .. } => "started",
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::StatusChanged { .. } => "status_changed",
            UploadEvent::ChunkCompleted { .. } => "chunk_completed",
            UploadEvent::ChunkFailed { .. } => "chunk_failed",
            UploadEvent::Completed { .. } => "completed",
            UploadEvent::Failed { .. } => "failed",
            UploadEvent::Paused { .. } => "paused",
            UploadEvent::Resumed { .. } => "resumed",
            UploadEvent::Cancelled { .. } => "cancelled",
            UploadEvent::TotalProgress { .. } => "total_progress",
            UploadEvent::SpeedChanged { .. } => "speed_changed",
            UploadEvent::QueueChanged { .. } => "queue_changed",
            UploadEvent::AllCompleted { .. } => "all_completed",
            UploadEvent::AllFailed { .. } => "all_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tag() {
        let event = UploadEvent::Progress {
            task_id: "t1".to_string(),
            uploaded_size: 512,
            total_size: 1024,
            progress: 50.0,
            speed: 256,
            completed_chunks: 1,
            total_chunks: 2,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "progress");
        assert_eq!(value["task_id"], "t1");
        assert_eq!(value["progress"], 50.0);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(EventPriority::High > EventPriority::Medium);
        assert!(EventPriority::Medium > EventPriority::Low);

        let progress = UploadEvent::Progress {
            task_id: "t1".to_string(),
            uploaded_size: 0,
            total_size: 1,
            progress: 0.0,
            speed: 0,
            completed_chunks: 0,
            total_chunks: 1,
        };
        let completed = UploadEvent::Completed {
            task_id: "t1".to_string(),
            file_name: "a.bin".to_string(),
            file_url: None,
            completed_at: 0,
        };
        assert_eq!(progress.priority(), EventPriority::Low);
        assert_eq!(completed.priority(), EventPriority::High);
    }

    #[test]
    fn test_task_id_accessor() {
        let event = UploadEvent::Cancelled {
            task_id: "abc".to_string(),
        };
        assert_eq!(event.task_id(), Some("abc"));

        let aggregate = UploadEvent::QueueChanged {
            pending: 1,
            active: 2,
            completed: 3,
        };
        assert_eq!(aggregate.task_id(), None);
    }
}
