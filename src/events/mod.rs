// 事件模块：事件类型定义、回调分发、进度节流

pub mod callback;
pub mod throttle;
pub mod types;

pub use callback::{CallbackManager, EventCallback, WILDCARD_EVENT};
pub use throttle::{ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};
pub use types::{EventPriority, UploadEvent};
