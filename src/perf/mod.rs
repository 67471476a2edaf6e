//! Performance Tracker: bounded in-memory ring buffers for queue-depth
//! samples and per-reply processing durations, with percentile stats.
//!
//! Grounded on `testing/dashboard/state.rs`'s `DashboardState` — a
//! `VecDeque` capped by popping from the front once a `MAX_EVENTS` bound is
//! exceeded — generalized here to two independently bounded buffers.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};

const QUEUE_DEPTH_CAP: usize = 1_000;
const DURATION_CAP: usize = 500;
const QUEUE_SAMPLE_INTERVAL_MS: i64 = 5_000;

#[derive(Debug, Clone, Copy)]
pub struct QueueDepthSample {
    pub timestamp_ms: i64,
    pub depth: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessingRecord {
    pub timestamp_ms: i64,
    pub duration_ms: i64,
    pub observation_count: i64,
    pub discovery_tokens: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ProcessingTimesStats {
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub observations_per_minute: f64,
    pub avg_queue_depth: f64,
    pub peak_queue_depth: i64,
    pub sample_count: i64,
}

/// Nearest-rank percentile: `index = ceil(p/100 * n) - 1` on a sorted set.
fn percentile(sorted: &[i64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let index = ((p / 100.0 * n as f64).ceil() as usize).saturating_sub(1);
    sorted[index.min(n - 1)] as f64
}

pub struct PerformanceTracker {
    queue_depths: Mutex<VecDeque<QueueDepthSample>>,
    durations: Mutex<VecDeque<ProcessingRecord>>,
    last_queue_sample_ms: AtomicI64,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self {
            queue_depths: Mutex::new(VecDeque::with_capacity(64)),
            durations: Mutex::new(VecDeque::with_capacity(64)),
            last_queue_sample_ms: AtomicI64::new(0),
        }
    }

    /// Rate-limited to one sample per 5s; calls within that window are no-ops.
    pub fn sample_queue_depth(&self, now_ms: i64, depth: i64) {
        let last = self.last_queue_sample_ms.load(Ordering::Relaxed);
        if now_ms - last < QUEUE_SAMPLE_INTERVAL_MS {
            return;
        }
        if self
            .last_queue_sample_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let mut depths = self.queue_depths.lock();
        depths.push_back(QueueDepthSample { timestamp_ms: now_ms, depth });
        while depths.len() > QUEUE_DEPTH_CAP {
            depths.pop_front();
        }
    }

    pub fn record_processing(&self, record: ProcessingRecord) {
        let mut durations = self.durations.lock();
        durations.push_back(record);
        while durations.len() > DURATION_CAP {
            durations.pop_front();
        }
    }

    fn queue_history_since(&self, since_ms: Option<i64>) -> Vec<QueueDepthSample> {
        self.queue_depths
            .lock()
            .iter()
            .filter(|s| since_ms.map(|since| s.timestamp_ms >= since).unwrap_or(true))
            .copied()
            .collect()
    }

    pub fn get_queue_history(&self, since_ms: Option<i64>) -> Vec<QueueDepthSample> {
        self.queue_history_since(since_ms)
    }

    pub fn get_processing_times(&self, since_ms: Option<i64>, limit: Option<usize>) -> ProcessingTimesStats {
        let mut records: Vec<ProcessingRecord> = self
            .durations
            .lock()
            .iter()
            .filter(|r| since_ms.map(|since| r.timestamp_ms >= since).unwrap_or(true))
            .copied()
            .collect();

        if let Some(limit) = limit {
            if records.len() > limit {
                records = records.split_off(records.len() - limit);
            }
        }

        if records.is_empty() {
            return ProcessingTimesStats::default();
        }

        let mut sorted_durations: Vec<i64> = records.iter().map(|r| r.duration_ms).collect();
        sorted_durations.sort_unstable();

        let avg = sorted_durations.iter().sum::<i64>() as f64 / sorted_durations.len() as f64;
        let p50 = percentile(&sorted_durations, 50.0);
        let p95 = percentile(&sorted_durations, 95.0);

        let total_observations: i64 = records.iter().map(|r| r.observation_count).sum();
        let earliest = records.iter().map(|r| r.timestamp_ms).min().unwrap();
        let latest = records.iter().map(|r| r.timestamp_ms).max().unwrap();
        let timespan_ms = (latest - earliest).max(1) as f64;
        let observations_per_minute = total_observations as f64 / (timespan_ms / 60_000.0);

        let queue_history = self.queue_history_since(since_ms);
        let (avg_queue_depth, peak_queue_depth) = if queue_history.is_empty() {
            (0.0, 0)
        } else {
            let sum: i64 = queue_history.iter().map(|s| s.depth).sum();
            let peak = queue_history.iter().map(|s| s.depth).max().unwrap_or(0);
            (sum as f64 / queue_history.len() as f64, peak)
        };

        ProcessingTimesStats {
            avg,
            p50,
            p95,
            observations_per_minute,
            avg_queue_depth,
            peak_queue_depth,
            sample_count: records.len() as i64,
        }
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: i64, duration: i64) -> ProcessingRecord {
        ProcessingRecord {
            timestamp_ms: ts,
            duration_ms: duration,
            observation_count: 1,
            discovery_tokens: 10,
        }
    }

    #[test]
    fn scenario_6_percentile() {
        let tracker = PerformanceTracker::new();
        for (i, d) in [10, 20, 30, 40, 50].into_iter().enumerate() {
            tracker.record_processing(record(i as i64 * 1000, d));
        }
        let stats = tracker.get_processing_times(None, None);
        assert_eq!(stats.avg, 30.0);
        assert_eq!(stats.p50, 30.0);
        assert_eq!(stats.p95, 50.0);
    }

    #[test]
    fn empty_set_is_all_zeros() {
        let tracker = PerformanceTracker::new();
        let stats = tracker.get_processing_times(None, None);
        assert_eq!(stats.avg, 0.0);
        assert_eq!(stats.p50, 0.0);
        assert_eq!(stats.p95, 0.0);
        assert_eq!(stats.sample_count, 0);
    }

    #[test]
    fn queue_depth_buffer_bounded() {
        let tracker = PerformanceTracker::new();
        for i in 0..(QUEUE_DEPTH_CAP + 10) {
            // bypass the 5s rate limit by resetting the gate each iteration
            tracker.last_queue_sample_ms.store(0, Ordering::Relaxed);
            tracker.sample_queue_depth(i as i64 * (QUEUE_SAMPLE_INTERVAL_MS + 1), i as i64);
        }
        assert_eq!(tracker.queue_depths.lock().len(), QUEUE_DEPTH_CAP);
    }
}
