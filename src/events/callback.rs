// 回调管理器
//
// 发布/订阅模型：同一事件类型可挂多个订阅者，回调按优先级降序、
// 同优先级按注册顺序执行；支持一次性订阅与 "*" 通配订阅。
// 回调在锁外执行，允许在回调内继续注册/注销。

use crate::events::types::{EventPriority, UploadEvent};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// 通配订阅键，匹配所有事件类型
pub const WILDCARD_EVENT: &str = "*";

/// 事件回调
pub type EventCallback = Arc<dyn Fn(&UploadEvent) + Send + Sync + 'static>;

/// 单个订阅记录
struct CallbackEntry {
    /// 订阅 ID（注销时使用；同时充当同优先级内的注册序号）
    id: u64,
    /// 回调优先级
    priority: EventPriority,
    /// 一次性订阅，触发后自动移除
    once: bool,
    callback: EventCallback,
}

/// 回调管理器
pub struct CallbackManager {
    /// 事件类型 -> 订阅列表
    listeners: DashMap<String, Vec<CallbackEntry>>,
    /// 订阅 ID 计数器
    next_id: AtomicU64,
}

impl CallbackManager {
    /// 创建空的回调管理器
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// 订阅事件（默认 Medium 优先级）
    ///
    /// # 返回
    /// 订阅 ID，用于 `off` 注销
    pub fn on<F>(&self, event_type: &str, callback: F) -> u64
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.register(event_type, EventPriority::Medium, false, Arc::new(callback))
    }

    /// 按指定优先级订阅事件
    pub fn on_with_priority<F>(&self, event_type: &str, priority: EventPriority, callback: F) -> u64
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.register(event_type, priority, false, Arc::new(callback))
    }

    /// 一次性订阅，触发一次后自动移除
    pub fn once<F>(&self, event_type: &str, callback: F) -> u64
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.register(event_type, EventPriority::Medium, true, Arc::new(callback))
    }

    fn register(
        &self,
        event_type: &str,
        priority: EventPriority,
        once: bool,
        callback: EventCallback,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .entry(event_type.to_string())
            .or_default()
            .push(CallbackEntry {
                id,
                priority,
                once,
                callback,
            });
        debug!("订阅事件 {} (id={}, once={})", event_type, id, once);
        id
    }

    /// 注销订阅
    ///
    /// # 返回
    /// 是否找到并移除了该订阅
    pub fn off(&self, event_type: &str, listener_id: u64) -> bool {
        if let Some(mut entries) = self.listeners.get_mut(event_type) {
            let before = entries.len();
            entries.retain(|e| e.id != listener_id);
            return entries.len() < before;
        }
        false
    }

    /// 发布事件
    ///
    /// 收集该事件类型与通配订阅，释放锁后按优先级降序执行；
    /// 一次性订阅在执行前移除，保证即使回调重入也至多触发一次
    pub fn emit(&self, event: &UploadEvent) {
        let type_name = event.event_type_name();
        let mut selected: Vec<(EventPriority, u64, EventCallback)> = Vec::new();

        for key in [type_name, WILDCARD_EVENT] {
            if let Some(mut entries) = self.listeners.get_mut(key) {
                for entry in entries.iter() {
                    selected.push((entry.priority, entry.id, Arc::clone(&entry.callback)));
                }
                entries.retain(|e| !e.once);
            }
        }

        if selected.is_empty() {
            return;
        }

        // 优先级降序，同优先级按注册顺序
        selected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, _, callback) in selected {
            callback(event);
        }
    }

    /// 某个事件类型的订阅数（不含通配订阅）
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.listeners
            .get(event_type)
            .map(|e| e.len())
            .unwrap_or(0)
    }

    /// 清空所有订阅
    pub fn clear(&self) {
        self.listeners.clear();
    }
}

impl Default for CallbackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackManager")
            .field("event_types", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn sample_event() -> UploadEvent {
        UploadEvent::Started {
            task_id: "t1".to_string(),
        }
    }

    #[test]
    fn test_priority_dispatch_order() {
        let manager = CallbackManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        manager.on_with_priority("started", EventPriority::Low, move |_| o.lock().push("low"));
        let o = Arc::clone(&order);
        manager.on_with_priority("started", EventPriority::High, move |_| {
            o.lock().push("high")
        });
        let o = Arc::clone(&order);
        manager.on_with_priority("started", EventPriority::Medium, move |_| {
            o.lock().push("medium")
        });

        manager.emit(&sample_event());
        assert_eq!(*order.lock(), vec!["high", "medium", "low"]);
    }

    #[test]
    fn test_registration_order_within_priority() {
        let manager = CallbackManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let o = Arc::clone(&order);
            manager.on("started", move |_| o.lock().push(tag));
        }

        manager.emit(&sample_event());
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_once_fires_single_time() {
        let manager = CallbackManager::new();
        let count = Arc::new(Mutex::new(0u32));

        let c = Arc::clone(&count);
        manager.once("started", move |_| *c.lock() += 1);

        manager.emit(&sample_event());
        manager.emit(&sample_event());
        assert_eq!(*count.lock(), 1);
        assert_eq!(manager.listener_count("started"), 0);
    }

    #[test]
    fn test_wildcard_receives_all_types() {
        let manager = CallbackManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        manager.on(WILDCARD_EVENT, move |e| {
            s.lock().push(e.event_type_name().to_string())
        });

        manager.emit(&sample_event());
        manager.emit(&UploadEvent::Cancelled {
            task_id: "t1".to_string(),
        });
        assert_eq!(*seen.lock(), vec!["started", "cancelled"]);
    }

    #[test]
    fn test_off_removes_listener() {
        let manager = CallbackManager::new();
        let count = Arc::new(Mutex::new(0u32));

        let c = Arc::clone(&count);
        let id = manager.on("started", move |_| *c.lock() += 1);
        assert!(manager.off("started", id));
        assert!(!manager.off("started", id));

        manager.emit(&sample_event());
        assert_eq!(*count.lock(), 0);
    }

    #[test]
    fn test_reentrant_subscribe_inside_callback() {
        let manager = Arc::new(CallbackManager::new());
        let count = Arc::new(Mutex::new(0u32));

        let m = Arc::clone(&manager);
        let c = Arc::clone(&count);
        manager.once("started", move |_| {
            let c2 = Arc::clone(&c);
            // 回调内继续注册不会死锁
            m.on("started", move |_| *c2.lock() += 1);
        });

        manager.emit(&sample_event());
        manager.emit(&sample_event());
        assert_eq!(*count.lock(), 1);
    }
}
