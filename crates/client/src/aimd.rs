//! Additive-increase / multiplicative-decrease concurrency control.
//!
//! The controller owns the number of chunks that may be in flight at once.
//! Sustained success grows it one step at a time; any timeout or error
//! shrinks it geometrically and starts a recovery window during which it may
//! not grow again.

use std::time::Duration;

use chunkferry_transfer::Ema;
use tokio::time::Instant;
use tracing::debug;

/// Tuning for [`AimdController`].
#[derive(Debug, Clone)]
pub struct AimdConfig {
    pub initial_concurrency: usize,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    /// Consecutive successes needed before each increase.
    pub success_threshold: u32,
    pub additive_increase: usize,
    /// Factor applied on failure; `0.5` halves the concurrency.
    pub multiplicative_decrease: f64,
    /// No increase is allowed this soon after a decrease.
    pub recovery_time: Duration,
}

impl Default for AimdConfig {
    fn default() -> Self {
        Self {
            initial_concurrency: 1,
            min_concurrency: 1,
            max_concurrency: 6,
            success_threshold: 5,
            additive_increase: 1,
            multiplicative_decrease: 0.5,
            recovery_time: Duration::from_secs(10),
        }
    }
}

impl AimdConfig {
    /// Default tuning with a caller-chosen ceiling.
    pub fn with_max(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            ..Self::default()
        }
    }
}

/// Why a chunk did not complete, as far as the controller cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Error,
    /// Deliberate cancellation; not a congestion signal.
    Abort,
}

/// Counters exposed for progress reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AimdStats {
    pub concurrency: usize,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    /// Smoothed throughput of completed chunks, bytes per second.
    pub throughput_bps: f64,
}

/// Concurrency controller for one upload.
#[derive(Debug)]
pub struct AimdController {
    config: AimdConfig,
    current: usize,
    consecutive_successes: u32,
    last_decrease: Option<Instant>,
    throughput: Ema,
    successes: u64,
    failures: u64,
    retries: u64,
}

impl AimdController {
    pub fn new(config: AimdConfig) -> Self {
        let min = config.min_concurrency.max(1);
        let max = config.max_concurrency.max(min);
        let current = config.initial_concurrency.clamp(min, max);
        Self {
            config: AimdConfig {
                min_concurrency: min,
                max_concurrency: max,
                ..config
            },
            current,
            consecutive_successes: 0,
            last_decrease: None,
            throughput: Ema::default(),
            successes: 0,
            failures: 0,
            retries: 0,
        }
    }

    /// How many chunks may be in flight right now.
    pub fn current_concurrency(&self) -> usize {
        self.current
    }

    /// Records a completed chunk.
    pub fn on_success(&mut self, elapsed: Duration, bytes: u64) {
        self.successes += 1;
        self.consecutive_successes += 1;

        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.throughput.update(bytes as f64 / secs);
        }

        if self.consecutive_successes < self.config.success_threshold
            || self.current >= self.config.max_concurrency
            || self.in_recovery()
        {
            return;
        }

        let next = (self.current + self.config.additive_increase).min(self.config.max_concurrency);
        debug!(from = self.current, to = next, "increasing concurrency");
        self.current = next;
        self.consecutive_successes = 0;
    }

    /// Records a chunk that timed out, failed or was aborted.
    pub fn on_failure(&mut self, kind: FailureKind) {
        if kind == FailureKind::Abort {
            return;
        }
        self.failures += 1;
        self.consecutive_successes = 0;
        self.last_decrease = Some(Instant::now());

        let scaled = (self.current as f64 * self.config.multiplicative_decrease).floor() as usize;
        let next = scaled.max(self.config.min_concurrency);
        if next != self.current {
            debug!(from = self.current, to = next, ?kind, "decreasing concurrency");
        }
        self.current = next;
    }

    /// Records a retry; informational only.
    pub fn on_retry(&mut self) {
        self.retries += 1;
    }

    pub fn stats(&self) -> AimdStats {
        AimdStats {
            concurrency: self.current,
            successes: self.successes,
            failures: self.failures,
            retries: self.retries,
            throughput_bps: self.throughput.value().unwrap_or(0.0),
        }
    }

    fn in_recovery(&self) -> bool {
        self.last_decrease
            .is_some_and(|at| at.elapsed() < self.config.recovery_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: u64 = 256 * 1024;

    fn succeed(ctl: &mut AimdController, n: usize) {
        for _ in 0..n {
            ctl.on_success(Duration::from_millis(100), CHUNK);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn grows_one_step_per_threshold() {
        let mut ctl = AimdController::new(AimdConfig::with_max(6));
        assert_eq!(ctl.current_concurrency(), 1);

        succeed(&mut ctl, 4);
        assert_eq!(ctl.current_concurrency(), 1);
        succeed(&mut ctl, 1);
        assert_eq!(ctl.current_concurrency(), 2);
        succeed(&mut ctl, 5);
        assert_eq!(ctl.current_concurrency(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_bounds() {
        let mut ctl = AimdController::new(AimdConfig::with_max(3));
        succeed(&mut ctl, 100);
        assert_eq!(ctl.current_concurrency(), 3);

        for _ in 0..10 {
            ctl.on_failure(FailureKind::Error);
        }
        assert_eq!(ctl.current_concurrency(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn increase_then_halve_on_timeout() {
        let mut ctl = AimdController::new(AimdConfig::with_max(6));
        succeed(&mut ctl, 5);
        assert_eq!(ctl.current_concurrency(), 2);

        ctl.on_failure(FailureKind::Timeout);
        assert_eq!(ctl.current_concurrency(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_window_blocks_growth() {
        let mut ctl = AimdController::new(AimdConfig {
            initial_concurrency: 4,
            ..AimdConfig::with_max(6)
        });
        ctl.on_failure(FailureKind::Error);
        assert_eq!(ctl.current_concurrency(), 2);

        succeed(&mut ctl, 20);
        assert_eq!(ctl.current_concurrency(), 2);

        // The streak kept counting inside the window, so the first success
        // after it is enough.
        tokio::time::advance(Duration::from_secs(11)).await;
        succeed(&mut ctl, 1);
        assert_eq!(ctl.current_concurrency(), 3);
        succeed(&mut ctl, 4);
        assert_eq!(ctl.current_concurrency(), 3);
        succeed(&mut ctl, 1);
        assert_eq!(ctl.current_concurrency(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn streak_built_after_window_grows_at_threshold() {
        let mut ctl = AimdController::new(AimdConfig {
            initial_concurrency: 4,
            ..AimdConfig::with_max(6)
        });
        ctl.on_failure(FailureKind::Error);
        assert_eq!(ctl.current_concurrency(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        succeed(&mut ctl, 4);
        assert_eq!(ctl.current_concurrency(), 2);
        succeed(&mut ctl, 1);
        assert_eq!(ctl.current_concurrency(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_resets_success_streak() {
        let mut ctl = AimdController::new(AimdConfig {
            recovery_time: Duration::ZERO,
            ..AimdConfig::with_max(6)
        });
        succeed(&mut ctl, 4);
        ctl.on_failure(FailureKind::Error);
        succeed(&mut ctl, 4);
        assert_eq!(ctl.current_concurrency(), 1);
        succeed(&mut ctl, 1);
        assert_eq!(ctl.current_concurrency(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_is_not_a_congestion_signal() {
        let mut ctl = AimdController::new(AimdConfig {
            initial_concurrency: 4,
            ..AimdConfig::with_max(6)
        });
        ctl.on_failure(FailureKind::Abort);
        assert_eq!(ctl.current_concurrency(), 4);
        assert_eq!(ctl.stats().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_track_counters_and_throughput() {
        let mut ctl = AimdController::new(AimdConfig::default());
        ctl.on_success(Duration::from_secs(1), 1000);
        ctl.on_success(Duration::from_secs(1), 2000);
        ctl.on_retry();
        ctl.on_failure(FailureKind::Timeout);

        let stats = ctl.stats();
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.retries, 1);
        assert!((stats.throughput_bps - 1300.0).abs() < 1e-6);
    }

    #[test]
    fn config_is_normalised() {
        let ctl = AimdController::new(AimdConfig {
            initial_concurrency: 10,
            min_concurrency: 0,
            max_concurrency: 0,
            ..AimdConfig::default()
        });
        assert_eq!(ctl.current_concurrency(), 1);
    }
}
