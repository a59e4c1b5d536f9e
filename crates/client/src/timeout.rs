//! Per-chunk timeout derived from recently observed throughput.

use std::collections::VecDeque;
use std::time::Duration;

/// Bounds for [`TimeoutEstimator`].
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub min: Duration,
    pub max: Duration,
    /// Used until at least one sample exists.
    pub default: Duration,
    /// Headroom applied on top of the estimated transfer time.
    pub multiplier: f64,
    /// Number of recent samples kept.
    pub window: usize,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(10),
            max: Duration::from_secs(120),
            default: Duration::from_secs(30),
            multiplier: 1.5,
            window: 10,
        }
    }
}

/// Sliding-window estimator of how long a chunk should take.
#[derive(Debug)]
pub struct TimeoutEstimator {
    config: TimeoutConfig,
    samples: VecDeque<(u64, Duration)>,
}

impl TimeoutEstimator {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.window),
            config,
        }
    }

    /// Records a completed chunk of `bytes` that took `elapsed`.
    pub fn record(&mut self, bytes: u64, elapsed: Duration) {
        if self.config.window == 0 {
            return;
        }
        if self.samples.len() == self.config.window {
            self.samples.pop_front();
        }
        self.samples.push_back((bytes, elapsed));
    }

    /// Average throughput over the window, bytes per second.
    pub fn throughput(&self) -> Option<f64> {
        let bytes: u64 = self.samples.iter().map(|(b, _)| b).sum();
        let secs: f64 = self.samples.iter().map(|(_, d)| d.as_secs_f64()).sum();
        (bytes > 0 && secs > 0.0).then(|| bytes as f64 / secs)
    }

    /// Timeout for the next chunk of `bytes`.
    pub fn timeout_for(&self, bytes: u64) -> Duration {
        let Some(rate) = self.throughput() else {
            return self.config.default;
        };
        let estimate = bytes as f64 / rate * self.config.multiplier;
        let secs = estimate.clamp(self.config.min.as_secs_f64(), self.config.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

impl Default for TimeoutEstimator {
    fn default() -> Self {
        Self::new(TimeoutConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1_000_000;

    #[test]
    fn default_without_samples() {
        let est = TimeoutEstimator::default();
        assert_eq!(est.timeout_for(MB), Duration::from_secs(30));
        assert!(est.throughput().is_none());
    }

    #[test]
    fn scales_with_observed_throughput() {
        let mut est = TimeoutEstimator::default();
        // 1 MB in 10 s: 15 s with headroom.
        est.record(MB, Duration::from_secs(10));
        assert_eq!(est.timeout_for(MB), Duration::from_secs(15));
    }

    #[test]
    fn clamped_to_bounds() {
        let mut fast = TimeoutEstimator::default();
        fast.record(MB, Duration::from_millis(10));
        assert_eq!(fast.timeout_for(MB), Duration::from_secs(10));

        let mut slow = TimeoutEstimator::default();
        slow.record(MB, Duration::from_secs(600));
        assert_eq!(slow.timeout_for(MB), Duration::from_secs(120));
    }

    #[test]
    fn only_recent_samples_count() {
        let mut est = TimeoutEstimator::default();
        est.record(MB, Duration::from_secs(100));
        for _ in 0..10 {
            est.record(MB, Duration::from_secs(20));
        }
        assert_eq!(est.throughput(), Some(MB as f64 / 20.0));
        assert_eq!(est.timeout_for(MB), Duration::from_secs(30));
    }
}
