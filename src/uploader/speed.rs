// 速度统计与剩余时间估算
//
// SpeedCalculator 维护按数量+时效双重限界的采样窗口：
// - current：对最近几个样本的瞬时速率做指数平滑（α=0.7），响应快
// - average：整个窗口的字节/耗时原始比值，平稳
// TimeEstimator 在原始估算上叠加平滑、趋势修正与振荡限幅，
// 避免 ETA 数字上蹿下跳

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;

/// 采样窗口最大样本数
pub const SPEED_WINDOW_SIZE: usize = 20;
/// 采样窗口最大时效（秒），超龄样本被淘汰
pub const SPEED_WINDOW_MAX_AGE_SECS: u64 = 10;
/// current 速度的平滑系数
const CURRENT_SMOOTHING: f64 = 0.7;
/// 瞬时速率取最近几个样本
const INSTANT_SAMPLE_COUNT: usize = 3;

/// ETA 平滑系数
const ETA_SMOOTHING: f64 = 0.3;
/// 单步最大上调 30%
const ETA_MAX_INCREASE_RATIO: f64 = 1.3;
/// 单步最大下调 30%（估算超过阈值后生效）
const ETA_MAX_DECREASE_RATIO: f64 = 0.7;
/// 下调限幅的生效阈值（秒）
const ETA_STABILITY_THRESHOLD_SECS: f64 = 10.0;
/// 趋势判定窗口
const ETA_TREND_WINDOW: usize = 5;
/// 持续变快时的下修系数
const ETA_TREND_NUDGE: f64 = 0.95;

#[derive(Debug, Clone)]
struct SpeedSample {
    bytes: u64,
    duration_ms: u64,
    recorded_at: Instant,
}

#[derive(Debug, Default)]
struct SpeedInner {
    samples: VecDeque<SpeedSample>,
    /// 平滑后的 current 速度 (bytes/s)
    smoothed: Option<f64>,
}

/// 上传速度计算器
///
/// 可被多个分片任务并发调用，内部用锁保护
#[derive(Debug, Default)]
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

impl SpeedCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次分片传输 (bytes, 耗时 ms)，返回本次瞬时速率 (bytes/s)
    pub fn record(&self, bytes: u64, duration_ms: u64) -> u64 {
        // 防止异常耗时污染窗口
        let duration_ms = duration_ms.clamp(1, 1_000_000);
        let rate = bytes * 1000 / duration_ms;

        let mut inner = self.inner.lock();
        inner.samples.push_back(SpeedSample {
            bytes,
            duration_ms,
            recorded_at: Instant::now(),
        });
        Self::evict(&mut inner);

        // 用最近几个样本算瞬时速率，再做指数平滑
        let instant = Self::instant_rate(&inner.samples);
        inner.smoothed = Some(match inner.smoothed {
            Some(prev) => prev + CURRENT_SMOOTHING * (instant - prev),
            None => instant,
        });

        rate
    }

    fn evict(inner: &mut SpeedInner) {
        while inner.samples.len() > SPEED_WINDOW_SIZE {
            inner.samples.pop_front();
        }
        let now = Instant::now();
        while let Some(front) = inner.samples.front() {
            if now.duration_since(front.recorded_at).as_secs() > SPEED_WINDOW_MAX_AGE_SECS {
                inner.samples.pop_front();
            } else {
                break;
            }
        }
        if inner.samples.is_empty() {
            inner.smoothed = None;
        }
    }

    fn instant_rate(samples: &VecDeque<SpeedSample>) -> f64 {
        let recent = samples.len().saturating_sub(INSTANT_SAMPLE_COUNT);
        let (bytes, ms) = samples
            .iter()
            .skip(recent)
            .fold((0u64, 0u64), |(b, m), s| (b + s.bytes, m + s.duration_ms));
        if ms == 0 {
            return 0.0;
        }
        bytes as f64 * 1000.0 / ms as f64
    }

    /// 平滑后的当前速度 (bytes/s)
    pub fn current_speed(&self) -> u64 {
        let mut inner = self.inner.lock();
        Self::evict(&mut inner);
        inner.smoothed.map(|s| s.round() as u64).unwrap_or(0)
    }

    /// 窗口内平均速度 (bytes/s)，不平滑
    pub fn average_speed(&self) -> u64 {
        let mut inner = self.inner.lock();
        Self::evict(&mut inner);
        let (bytes, ms) = inner
            .samples
            .iter()
            .fold((0u64, 0u64), |(b, m), s| (b + s.bytes, m + s.duration_ms));
        if ms == 0 {
            return 0;
        }
        bytes * 1000 / ms
    }

    pub fn sample_count(&self) -> usize {
        self.inner.lock().samples.len()
    }

    /// 清空窗口（并发数调整后带宽重新分配，旧样本失真）
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.samples.clear();
        inner.smoothed = None;
    }
}

#[derive(Debug, Default)]
struct EstimatorInner {
    last_estimate: Option<f64>,
    recent_raw: VecDeque<f64>,
}

/// 剩余时间估算器
#[derive(Debug, Default)]
pub struct TimeEstimator {
    inner: Mutex<EstimatorInner>,
}

impl TimeEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 估算剩余秒数
    ///
    /// 速度为 0 时无法估算返回 None；剩余为 0 时返回 0 并复位
    pub fn estimate(&self, remaining_bytes: u64, speed_bps: u64) -> Option<u64> {
        if remaining_bytes == 0 {
            self.reset();
            return Some(0);
        }
        if speed_bps == 0 {
            return None;
        }

        let raw = remaining_bytes as f64 / speed_bps as f64;
        let mut inner = self.inner.lock();

        inner.recent_raw.push_back(raw);
        while inner.recent_raw.len() > ETA_TREND_WINDOW {
            inner.recent_raw.pop_front();
        }

        let mut estimate = match inner.last_estimate {
            Some(prev) => prev + ETA_SMOOTHING * (raw - prev),
            None => raw,
        };

        // 持续变快时主动下修，抵消平滑带来的滞后
        if inner.recent_raw.len() == ETA_TREND_WINDOW
            && inner.recent_raw.iter().zip(inner.recent_raw.iter().skip(1)).all(|(a, b)| b < a)
        {
            estimate *= ETA_TREND_NUDGE;
        }

        // 限幅：禁止单步上调超 30%；估算超过 10s 后禁止单步下调超 30%
        if let Some(prev) = inner.last_estimate {
            estimate = estimate.min(prev * ETA_MAX_INCREASE_RATIO);
            if prev > ETA_STABILITY_THRESHOLD_SECS {
                estimate = estimate.max(prev * ETA_MAX_DECREASE_RATIO);
            }
        }

        inner.last_estimate = Some(estimate);
        Some(estimate.round() as u64)
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.last_estimate = None;
        inner.recent_raw.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_speed_raw_ratio() {
        let calc = SpeedCalculator::new();
        calc.record(1000, 1000);
        calc.record(3000, 1000);
        // (1000+3000) bytes / 2000 ms = 2000 B/s
        assert_eq!(calc.average_speed(), 2000);
    }

    #[test]
    fn test_current_speed_smoothing() {
        let calc = SpeedCalculator::new();
        assert_eq!(calc.current_speed(), 0);

        calc.record(1000, 1000);
        assert_eq!(calc.current_speed(), 1000);

        calc.record(3000, 1000);
        // 瞬时 = 4000/2s = 2000，平滑 = 1000 + 0.7*(2000-1000) = 1700
        assert_eq!(calc.current_speed(), 1700);
    }

    #[test]
    fn test_window_bounded_by_count() {
        let calc = SpeedCalculator::new();
        for _ in 0..(SPEED_WINDOW_SIZE + 10) {
            calc.record(1000, 100);
        }
        assert_eq!(calc.sample_count(), SPEED_WINDOW_SIZE);
    }

    #[test]
    fn test_record_guards_zero_duration() {
        let calc = SpeedCalculator::new();
        // 0ms 被钳到 1ms，不会除零
        let rate = calc.record(1000, 0);
        assert_eq!(rate, 1_000_000);
    }

    #[test]
    fn test_reset_clears_window() {
        let calc = SpeedCalculator::new();
        calc.record(1000, 1000);
        assert!(calc.sample_count() > 0);
        calc.reset();
        assert_eq!(calc.sample_count(), 0);
        assert_eq!(calc.current_speed(), 0);
    }

    #[test]
    fn test_eta_first_estimate_is_raw() {
        let eta = TimeEstimator::new();
        // 1000 bytes / 100 B/s = 10s
        assert_eq!(eta.estimate(1000, 100), Some(10));
    }

    #[test]
    fn test_eta_zero_speed_and_done() {
        let eta = TimeEstimator::new();
        assert_eq!(eta.estimate(1000, 0), None);
        assert_eq!(eta.estimate(0, 100), Some(0));
    }

    #[test]
    fn test_eta_increase_capped_at_30_percent() {
        let eta = TimeEstimator::new();
        assert_eq!(eta.estimate(1000, 100), Some(10)); // 10s
        // 速度骤降，原始估算 100s，但单步最多 10 * 1.3 = 13s
        assert_eq!(eta.estimate(1000, 10), Some(13));
    }

    #[test]
    fn test_eta_decrease_floored_after_threshold() {
        let eta = TimeEstimator::new();
        let first = eta.estimate(100_000, 1000).unwrap(); // 100s
        assert_eq!(first, 100);
        // 速度骤升，下调被限制在 30% 以内
        let second = eta.estimate(100, 1000).unwrap();
        assert!(second >= 70, "second={}", second);
        assert!(second < first);
    }

    #[test]
    fn test_eta_monotonic_on_steady_improvement() {
        let eta = TimeEstimator::new();
        let mut last = u64::MAX;
        let mut remaining = 50_000u64;
        for _ in 0..8 {
            let estimate = eta.estimate(remaining, 1000).unwrap();
            assert!(estimate <= last, "estimate={} last={}", estimate, last);
            last = estimate;
            remaining = remaining * 8 / 10;
        }
    }
}
