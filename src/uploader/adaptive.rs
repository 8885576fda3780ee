// 网络自适应调优
//
// 周期性采样整体上传速度，根据快慢阈值建议升降并发：
// - 持续低于慢阈值且有多个活跃任务 → 文件/分片并发各降一级（下限 1）
// - 持续高于快阈值且并发已打满 → 各升一级（上限为用户配置值）
// 建议性质，调度器决定是否采纳；每次调整后采样窗口清零重新观察

use crate::config::{AdaptiveConfig, ConcurrencyConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info};

/// 网络质量标签
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    /// 尚无样本
    Unknown,
    Slow,
    Normal,
    Fast,
}

impl NetworkQuality {
    pub fn from_speed(speed_bps: u64, slow_threshold: u64, fast_threshold: u64) -> Self {
        if speed_bps == 0 {
            NetworkQuality::Unknown
        } else if speed_bps < slow_threshold {
            NetworkQuality::Slow
        } else if speed_bps > fast_threshold {
            NetworkQuality::Fast
        } else {
            NetworkQuality::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkQuality::Unknown => "unknown",
            NetworkQuality::Slow => "slow",
            NetworkQuality::Normal => "normal",
            NetworkQuality::Fast => "fast",
        }
    }
}

/// 自适应并发调优器
#[derive(Debug)]
pub struct AdaptiveTuner {
    config: AdaptiveConfig,
    enabled: bool,
    /// 用户声明的并发上限（调优天花板）
    declared_files: AtomicUsize,
    declared_chunks: AtomicUsize,
    /// 当前生效并发
    current_files: AtomicUsize,
    current_chunks: AtomicUsize,
    /// 上次采样时刻 (Unix ms)
    last_sample_ms: AtomicU64,
    /// 速度采样历史 (bytes/s)
    history: Mutex<VecDeque<u64>>,
}

impl AdaptiveTuner {
    pub fn new(config: AdaptiveConfig, concurrency: &ConcurrencyConfig, enabled: bool) -> Self {
        Self {
            config,
            enabled,
            declared_files: AtomicUsize::new(concurrency.max_concurrent_files),
            declared_chunks: AtomicUsize::new(concurrency.max_concurrent_chunks),
            current_files: AtomicUsize::new(concurrency.max_concurrent_files),
            current_chunks: AtomicUsize::new(concurrency.max_concurrent_chunks),
            last_sample_ms: AtomicU64::new(0),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// 当前生效的 (文件并发, 分片并发)
    pub fn current_limits(&self) -> (usize, usize) {
        (
            self.current_files.load(Ordering::Relaxed),
            self.current_chunks.load(Ordering::Relaxed),
        )
    }

    /// 按当前速度给出网络质量标签
    pub fn quality(&self, speed_bps: u64) -> NetworkQuality {
        NetworkQuality::from_speed(
            speed_bps,
            self.config.slow_threshold_bytes,
            self.config.fast_threshold_bytes,
        )
    }

    /// 用户调整并发配置：上限与当前值都回到新声明值，历史清零
    pub fn set_declared(&self, max_files: usize, max_chunks: usize) {
        self.declared_files.store(max_files, Ordering::Relaxed);
        self.declared_chunks.store(max_chunks, Ordering::Relaxed);
        self.current_files.store(max_files, Ordering::Relaxed);
        self.current_chunks.store(max_chunks, Ordering::Relaxed);
        self.history.lock().clear();
        info!("并发配置更新: 文件={}, 分片={}", max_files, max_chunks);
    }

    /// 观察一次整体速度，必要时给出新的并发建议
    ///
    /// 返回 Some((文件并发, 分片并发)) 表示建议调整；采样受频率限制，
    /// 窗口未满时只积累样本不做判断
    pub fn observe(&self, speed_bps: u64, active_files: usize) -> Option<(usize, usize)> {
        if !self.enabled || speed_bps == 0 {
            return None;
        }

        // 采样频率限制
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        let last = self.last_sample_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < self.config.check_interval_secs * 1000 {
            return None;
        }
        self.last_sample_ms.store(now_ms, Ordering::Relaxed);

        let mean = {
            let mut history = self.history.lock();
            history.push_back(speed_bps);
            while history.len() > self.config.sample_window {
                history.pop_front();
            }
            // 前期保护：窗口未满不判断
            if history.len() < self.config.sample_window {
                return None;
            }
            history.iter().sum::<u64>() / history.len() as u64
        };

        let files = self.current_files.load(Ordering::Relaxed);
        let chunks = self.current_chunks.load(Ordering::Relaxed);

        if mean < self.config.slow_threshold_bytes && active_files > 1 && files > 1 {
            let new_files = files - 1;
            let new_chunks = chunks.saturating_sub(1).max(1);
            self.apply(new_files, new_chunks);
            info!(
                "📊 网络偏慢 (均速 {} B/s < {} B/s)，并发下调: 文件 {}→{}, 分片 {}→{}",
                mean, self.config.slow_threshold_bytes, files, new_files, chunks, new_chunks
            );
            return Some((new_files, new_chunks));
        }

        let declared_files = self.declared_files.load(Ordering::Relaxed);
        let declared_chunks = self.declared_chunks.load(Ordering::Relaxed);
        if mean > self.config.fast_threshold_bytes
            && active_files >= files
            && (files < declared_files || chunks < declared_chunks)
        {
            let new_files = (files + 1).min(declared_files);
            let new_chunks = (chunks + 1).min(declared_chunks);
            self.apply(new_files, new_chunks);
            info!(
                "📊 网络良好 (均速 {} B/s > {} B/s)，并发上调: 文件 {}→{}, 分片 {}→{}",
                mean, self.config.fast_threshold_bytes, files, new_files, chunks, new_chunks
            );
            return Some((new_files, new_chunks));
        }

        debug!("自适应采样: 均速={} B/s, 并发维持 ({}, {})", mean, files, chunks);
        None
    }

    fn apply(&self, files: usize, chunks: usize) {
        self.current_files.store(files, Ordering::Relaxed);
        self.current_chunks.store(chunks, Ordering::Relaxed);
        // 调整后重新观察
        self.history.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_config(window: usize) -> AdaptiveConfig {
        AdaptiveConfig {
            check_interval_secs: 0, // 测试中不限频
            sample_window: window,
            slow_threshold_bytes: 256 * 1024,
            fast_threshold_bytes: 2 * 1024 * 1024,
        }
    }

    fn concurrency(files: usize, chunks: usize) -> ConcurrencyConfig {
        ConcurrencyConfig {
            max_concurrent_files: files,
            max_concurrent_chunks: chunks,
        }
    }

    #[test]
    fn test_quality_labels() {
        let slow = 256 * 1024;
        let fast = 2 * 1024 * 1024;
        assert_eq!(NetworkQuality::from_speed(0, slow, fast), NetworkQuality::Unknown);
        assert_eq!(NetworkQuality::from_speed(1024, slow, fast), NetworkQuality::Slow);
        assert_eq!(NetworkQuality::from_speed(1024 * 1024, slow, fast), NetworkQuality::Normal);
        assert_eq!(
            NetworkQuality::from_speed(10 * 1024 * 1024, slow, fast),
            NetworkQuality::Fast
        );
    }

    #[test]
    fn test_decrease_on_slow_network() {
        let tuner = AdaptiveTuner::new(instant_config(3), &concurrency(3, 3), true);

        // 窗口未满不判断
        assert!(tuner.observe(1000, 2).is_none());
        assert!(tuner.observe(1000, 2).is_none());
        // 第三个样本触发下调
        assert_eq!(tuner.observe(1000, 2), Some((2, 2)));
        assert_eq!(tuner.current_limits(), (2, 2));
    }

    #[test]
    fn test_floor_at_one() {
        let tuner = AdaptiveTuner::new(instant_config(1), &concurrency(2, 2), true);
        assert_eq!(tuner.observe(1000, 2), Some((1, 1)));
        // 已到下限，不再下调
        assert!(tuner.observe(1000, 2).is_none());
        assert_eq!(tuner.current_limits(), (1, 1));
    }

    #[test]
    fn test_no_decrease_with_single_active_file() {
        let tuner = AdaptiveTuner::new(instant_config(1), &concurrency(3, 3), true);
        // 只有一个活跃任务时慢不是并发的锅
        assert!(tuner.observe(1000, 1).is_none());
        assert_eq!(tuner.current_limits(), (3, 3));
    }

    #[test]
    fn test_increase_capped_by_declared() {
        let tuner = AdaptiveTuner::new(instant_config(1), &concurrency(3, 3), true);

        // 先降到 2
        assert_eq!(tuner.observe(1000, 3), Some((2, 2)));
        // 网络转好且并发打满 → 升回 3
        assert_eq!(tuner.observe(10 * 1024 * 1024, 2), Some((3, 3)));
        // 已到声明上限，不再上调
        assert!(tuner.observe(10 * 1024 * 1024, 3).is_none());
        assert_eq!(tuner.current_limits(), (3, 3));
    }

    #[test]
    fn test_no_increase_when_not_saturated() {
        let tuner = AdaptiveTuner::new(instant_config(1), &concurrency(3, 3), true);
        tuner.observe(1000, 3); // 降到 2
        // 活跃任务数未打满当前并发，说明瓶颈不在并发数
        assert!(tuner.observe(10 * 1024 * 1024, 1).is_none());
    }

    #[test]
    fn test_disabled_never_advises() {
        let tuner = AdaptiveTuner::new(instant_config(1), &concurrency(3, 3), false);
        assert!(tuner.observe(1000, 3).is_none());
        assert_eq!(tuner.current_limits(), (3, 3));
    }

    #[test]
    fn test_set_declared_resets() {
        let tuner = AdaptiveTuner::new(instant_config(1), &concurrency(3, 3), true);
        tuner.observe(1000, 3); // 降到 2
        tuner.set_declared(5, 4);
        assert_eq!(tuner.current_limits(), (5, 4));
    }
}
