use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Smoothing factor used for throughput averages.
pub const DEFAULT_EMA_ALPHA: f64 = 0.3;

/// Minimum spacing between speed samples.
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// No new bytes for this long means the transfer is stalled.
const STALL_AFTER: Duration = Duration::from_secs(5);

/// Exponential moving average.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    /// Folds a sample in. The first sample seeds the average.
    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

impl Default for Ema {
    fn default() -> Self {
        Self::new(DEFAULT_EMA_ALPHA)
    }
}

/// Point-in-time view of an upload's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    /// Smoothed speed in bytes/second (0 when stalled or unknown).
    pub speed_bps: f64,
    /// `None` when the speed is zero or the transfer is stalled.
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    /// Returns progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.uploaded_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Folds chunk completions and partial in-flight progress into one byte
/// count, smoothed speed and ETA.
///
/// Uploaded bytes = completed-chunk bytes + partial bytes of every chunk
/// still in flight. A chunk that fails drops its partial bytes again.
#[derive(Debug)]
pub struct ProgressAggregator {
    total_bytes: u64,
    completed_bytes: u64,
    in_flight: HashMap<u32, u64>,
    speed: Ema,
    last_sample: Option<(Instant, u64)>,
    last_advance: Instant,
}

impl ProgressAggregator {
    /// `already_uploaded` covers chunks the server confirmed before this run.
    pub fn new(total_bytes: u64, already_uploaded: u64) -> Self {
        Self {
            total_bytes,
            completed_bytes: already_uploaded.min(total_bytes),
            in_flight: HashMap::new(),
            speed: Ema::default(),
            last_sample: None,
            last_advance: Instant::now(),
        }
    }

    /// Records cumulative bytes sent for an in-flight chunk.
    pub fn chunk_progress(&mut self, index: u32, bytes_sent: u64) {
        let entry = self.in_flight.entry(index).or_insert(0);
        if bytes_sent > *entry {
            *entry = bytes_sent;
            self.last_advance = Instant::now();
        }
    }

    /// Marks a chunk as durably stored by the server.
    pub fn chunk_completed(&mut self, index: u32, len: u64) {
        self.in_flight.remove(&index);
        self.completed_bytes = (self.completed_bytes + len).min(self.total_bytes);
        self.last_advance = Instant::now();
    }

    /// Drops the partial progress of a chunk that will be re-sent or was abandoned.
    pub fn chunk_reset(&mut self, index: u32) {
        self.in_flight.remove(&index);
    }

    pub fn uploaded_bytes(&self) -> u64 {
        let partial: u64 = self.in_flight.values().sum();
        (self.completed_bytes + partial).min(self.total_bytes)
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.total_bytes - self.uploaded_bytes()
    }

    /// Takes a speed sample and returns the current snapshot.
    pub fn snapshot(&mut self) -> ProgressSnapshot {
        let now = Instant::now();
        let uploaded = self.uploaded_bytes();

        match self.last_sample {
            None => self.last_sample = Some((now, uploaded)),
            Some((at, bytes)) => {
                let elapsed = now.duration_since(at);
                if elapsed >= MIN_SAMPLE_INTERVAL {
                    let delta = uploaded.saturating_sub(bytes) as f64;
                    self.speed.update(delta / elapsed.as_secs_f64());
                    self.last_sample = Some((now, uploaded));
                }
            }
        }

        let stalled = now.duration_since(self.last_advance) >= STALL_AFTER;
        let speed_bps = if stalled {
            0.0
        } else {
            self.speed.value().unwrap_or(0.0)
        };
        let remaining = self.total_bytes.saturating_sub(uploaded);
        let eta = if speed_bps > 0.0 {
            Duration::try_from_secs_f64(remaining as f64 / speed_bps).ok()
        } else {
            None
        };

        ProgressSnapshot {
            uploaded_bytes: uploaded,
            total_bytes: self.total_bytes,
            speed_bps,
            eta,
        }
    }
}
