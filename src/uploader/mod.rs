// 上传模块
//
// 分层结构：
// - manager：多任务编排（队列、并发上限、批量操作、聚合统计）
// - engine：单任务流水线（秒传 → 分片 → 重试 → 合并）
// - client：HTTP 传输层，请求形状可由 transformer 定制
// - chunk/task：分片与任务的状态机
// - validate/hasher/speed/adaptive：准入校验、哈希、测速、自适应调参

pub mod adaptive;
pub mod chunk;
pub mod client;
pub mod engine;
pub mod hasher;
pub mod manager;
pub mod speed;
pub mod task;
pub mod validate;

pub use adaptive::{AdaptiveTuner, NetworkQuality};
pub use chunk::{effective_chunk_size, ChunkStatus, UploadChunk, UploadChunkManager};
pub use client::{
    CheckRequest, CheckResponse, ChunkClient, ChunkRequest, ChunkUploadResponse, DefaultTransformer,
    MergeRequest, MergeResponse, RequestTransformer,
};
pub use engine::{RunOutcome, TaskHandle, UploadEngine};
pub use hasher::FileHasher;
pub use manager::{UploadManager, UploadStats};
pub use speed::{SpeedCalculator, TimeEstimator};
pub use task::{TaskOptions, TaskStatus, UploadTask};
pub use validate::{AcceptedFile, FileValidator};
