// 上传错误类型定义
//
// 错误分为六类：网络错误、超时、服务器错误、中止（协作取消）、校验失败、未知。
// 只有网络/超时/服务器错误可重试；中止错误永远不重试、也不作为失败上报给用户。
// 每个错误携带结构化上下文（任务 ID、分片序号、重试次数），可序列化用于日志排查。

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// 错误上下文
///
/// 记录错误发生时的任务/分片信息，随错误一起序列化到日志
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// 任务 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// 分片序号（任务级错误为 None）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    /// 错误发生时该分片已消耗的重试次数
    #[serde(default)]
    pub retry_count: u32,
}

impl ErrorContext {
    /// 创建任务级上下文
    pub fn for_task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            chunk_index: None,
            retry_count: 0,
        }
    }

    /// 附加分片序号
    pub fn with_chunk(mut self, index: usize) -> Self {
        self.chunk_index = Some(index);
        self
    }

    /// 附加重试次数
    pub fn with_retry(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadErrorKind {
    /// 网络错误（连接失败、连接中断等）
    Network,
    /// 请求超时
    Timeout,
    /// 服务器返回非 2xx
    Server,
    /// 协作取消（暂停/取消触发的中止）
    Abort,
    /// 入队前的文件校验失败
    Validation,
    /// 其他未知错误
    Unknown,
}

impl UploadErrorKind {
    /// 该类错误是否可重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadErrorKind::Network | UploadErrorKind::Timeout | UploadErrorKind::Server
        )
    }

    /// 面向用户的固定提示语（与内部错误详情分离）
    pub fn user_message(&self) -> &'static str {
        match self {
            UploadErrorKind::Network => "网络连接异常，请检查网络后重试",
            UploadErrorKind::Timeout => "请求超时，请稍后重试",
            UploadErrorKind::Server => "服务器繁忙，请稍后重试",
            UploadErrorKind::Abort => "上传已取消",
            UploadErrorKind::Validation => "文件校验未通过",
            UploadErrorKind::Unknown => "上传失败，请重试",
        }
    }
}

/// 上传错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 网络错误
    #[error("网络错误: {message}")]
    Network {
        message: String,
        context: ErrorContext,
    },

    /// 请求超时
    #[error("请求超时（{timeout_secs}秒）")]
    Timeout {
        timeout_secs: u64,
        context: ErrorContext,
    },

    /// 服务器错误，携带 HTTP 状态码
    #[error("服务器错误 (HTTP {status}): {message}")]
    Server {
        status: u16,
        message: String,
        context: ErrorContext,
    },

    /// 协作取消导致的中止
    #[error("操作已中止")]
    Abort { context: ErrorContext },

    /// 文件校验失败（未产生任何网络请求）
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// 未知错误
    #[error("未知错误: {message}")]
    Unknown {
        message: String,
        context: ErrorContext,
    },
}

impl UploadError {
    /// 获取错误分类
    pub fn kind(&self) -> UploadErrorKind {
        match self {
            UploadError::Network { .. } => UploadErrorKind::Network,
            UploadError::Timeout { .. } => UploadErrorKind::Timeout,
            UploadError::Server { .. } => UploadErrorKind::Server,
            UploadError::Abort { .. } => UploadErrorKind::Abort,
            UploadError::Validation(_) => UploadErrorKind::Validation,
            UploadError::Unknown { .. } => UploadErrorKind::Unknown,
        }
    }

    /// 是否可重试
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// 是否为协作取消
    pub fn is_abort(&self) -> bool {
        matches!(self, UploadError::Abort { .. })
    }

    /// 获取错误上下文（校验错误没有上下文）
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            UploadError::Network { context, .. }
            | UploadError::Timeout { context, .. }
            | UploadError::Server { context, .. }
            | UploadError::Abort { context }
            | UploadError::Unknown { context, .. } => Some(context),
            UploadError::Validation(_) => None,
        }
    }

    /// 更新上下文中的重试次数（重试循环在上报前回填）
    pub fn set_retry_count(&mut self, retry_count: u32) {
        if let Some(ctx) = self.context_mut() {
            ctx.retry_count = retry_count;
        }
    }

    fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            UploadError::Network { context, .. }
            | UploadError::Timeout { context, .. }
            | UploadError::Server { context, .. }
            | UploadError::Abort { context }
            | UploadError::Unknown { context, .. } => Some(context),
            UploadError::Validation(_) => None,
        }
    }

    /// 面向用户的提示语
    ///
    /// 校验错误展示具体原因，其余类别使用固定文案
    pub fn user_message(&self) -> String {
        match self {
            UploadError::Validation(v) => v.to_string(),
            other => other.kind().user_message().to_string(),
        }
    }

    /// 序列化为结构化日志内容（分类 + 详情 + 上下文）
    pub fn to_log_value(&self) -> serde_json::Value {
        json!({
            "kind": self.kind(),
            "message": self.to_string(),
            "retryable": self.is_retryable(),
            "context": self.context(),
        })
    }

    /// 构造中止错误
    pub fn abort(context: ErrorContext) -> Self {
        UploadError::Abort { context }
    }

    /// 从 reqwest 错误分类
    ///
    /// 超时 → Timeout，连接/发送失败 → Network，其余（如响应解析失败）→ Unknown
    pub fn from_reqwest(err: reqwest::Error, timeout_secs: u64, context: ErrorContext) -> Self {
        if err.is_timeout() {
            UploadError::Timeout {
                timeout_secs,
                context,
            }
        } else if err.is_connect() || err.is_request() || err.is_body() {
            UploadError::Network {
                message: err.to_string(),
                context,
            }
        } else {
            UploadError::Unknown {
                message: err.to_string(),
                context,
            }
        }
    }
}

/// 文件校验错误
///
/// 在入队前同步返回，不进入任何队列
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ValidationError {
    /// 空文件
    #[error("文件为空")]
    EmptyFile,

    /// 超过单文件大小上限
    #[error("文件过大: {size} 字节（上限 {limit} 字节）")]
    TooLarge { size: u64, limit: u64 },

    /// 低于单文件大小下限
    #[error("文件过小: {size} 字节（下限 {limit} 字节）")]
    TooSmall { size: u64, limit: u64 },

    /// 扩展名不在允许列表内
    #[error("不支持的文件类型: {extension}")]
    UnsupportedType { extension: String },

    /// 超出队列文件数量上限
    #[error("超出文件数量限制（最多 {limit} 个）")]
    TooManyFiles { limit: usize },

    /// 文件不存在或元数据读取失败
    #[error("文件不可读: {path}")]
    Unreadable { path: String },
}

/// 校验被拒绝的文件及原因
#[derive(Debug, Clone, Serialize)]
pub struct RejectedFile {
    /// 文件路径
    pub path: String,
    /// 文件名
    pub file_name: String,
    /// 拒绝原因
    pub reason: ValidationError,
}
