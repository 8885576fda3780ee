//! 进度事件节流器
//!
//! 限制进度类事件的发布频率，避免每个分片回调都打满订阅者。
//! 终态更新（完成/失败）走 force_emit，不受节流影响。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
///
/// 基于原子 CAS 的时间节流，无锁且可跨任务共享。
/// 典型用法：更新进度前调用 `should_emit()`，返回 true 才发事件。
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 上次放行的时间戳（相对进程基准时刻的纳秒数）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    /// 创建节流器
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    /// 使用默认间隔（200ms）创建
    pub fn default_interval() -> Self {
        Self::new(Duration::from_millis(DEFAULT_THROTTLE_INTERVAL_MS))
    }

    /// 使用指定毫秒间隔创建
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 是否放行本次事件
    ///
    /// 距上次放行超过间隔时返回 true 并推进时间戳；
    /// CAS 失败说明其他任务刚刚放行过，本次不再发布
    pub fn should_emit(&self) -> bool {
        let now_nanos = Self::current_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if now_nanos.saturating_sub(last) >= self.interval_nanos {
            self.last_emit_nanos
                .compare_exchange_weak(last, now_nanos, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }

    /// 强制放行（终态更新使用）
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos
            .store(Self::current_nanos(), Ordering::Relaxed);
        true
    }

    /// 重置节流状态
    pub fn reset(&self) {
        self.last_emit_nanos.store(0, Ordering::Relaxed);
    }

    /// 当前时刻相对进程基准的纳秒数
    ///
    /// 基准时刻进程内唯一，保证多任务看到同一时间轴；
    /// 使用 Instant 避免系统时钟跳变
    fn current_nanos() -> u64 {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::default_interval()
    }
}

impl Clone for ProgressThrottler {
    fn clone(&self) -> Self {
        Self {
            last_emit_nanos: AtomicU64::new(self.last_emit_nanos.load(Ordering::Relaxed)),
            interval_nanos: self.interval_nanos,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_emit_passes() {
        let throttler = ProgressThrottler::with_millis(100);
        assert!(throttler.should_emit());
        assert!(!throttler.should_emit());
    }

    #[test]
    fn test_emit_after_interval() {
        let throttler = ProgressThrottler::with_millis(50);
        assert!(throttler.should_emit());

        thread::sleep(Duration::from_millis(60));
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_force_emit_ignores_interval() {
        let throttler = ProgressThrottler::with_millis(1000);
        assert!(throttler.should_emit());
        assert!(!throttler.should_emit());
        assert!(throttler.force_emit());
    }

    #[test]
    fn test_reset_reopens_gate() {
        let throttler = ProgressThrottler::with_millis(1000);
        throttler.should_emit();
        assert!(!throttler.should_emit());

        throttler.reset();
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_shared_across_threads() {
        use std::sync::Arc;

        let throttler = Arc::new(ProgressThrottler::with_millis(1000));
        let mut passed = 0;
        let mut handles = Vec::new();
        for _ in 0..4 {
            let t = Arc::clone(&throttler);
            handles.push(thread::spawn(move || t.should_emit()));
        }
        for h in handles {
            if h.join().unwrap() {
                passed += 1;
            }
        }
        // 并发竞争下最多一个线程放行
        assert!(passed <= 1);
    }
}
