// 分片上传客户端核心库
//
// 面向任意「分片 + 合并」协议的上传客户端：并发调度、断点续传、
// 秒传、自适应并发与事件回调。服务端协议形状由 RequestTransformer 定制。

// 配置管理模块
pub mod config;

// 错误类型模块
pub mod error;

// 事件与回调模块
pub mod events;

// 进度/秒传缓存模块
pub mod cache;

// 日志模块
pub mod logging;

// 上传模块
pub mod uploader;

// 导出常用类型
pub use cache::{CachedProgressData, CompletedChunk, DedupCache, DedupRecord, ProgressCacheStore};
pub use config::UploaderConfig;
pub use error::{ErrorContext, RejectedFile, UploadError, UploadErrorKind, ValidationError};
pub use events::{CallbackManager, EventPriority, ProgressThrottler, UploadEvent};
pub use logging::{init_logging, LogGuard};
pub use uploader::{
    ChunkClient, DefaultTransformer, RequestTransformer, TaskOptions, TaskStatus, UploadManager,
    UploadStats, UploadTask,
};
