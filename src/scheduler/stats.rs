//! Slot wait and contention statistics
//!
//! Counters are lock-free atomics so every source thread can record without
//! serializing on the others. Wait-time percentiles come from a rolling
//! window of recent waits, which is the only mutex in here and is held for a
//! push or a copy.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Size of the rolling window for wait-time percentiles
const RECENT_WINDOW_SIZE: usize = 256;

/// Shared counters for one scheduler
#[derive(Debug)]
pub struct SchedulerStats {
    grants: AtomicU64,
    total_wait_ms: AtomicU64,
    max_wait_ms: AtomicU64,
    /// Stale lock holders forcibly reclaimed
    contention_count: AtomicU64,
    /// Acquisitions that found a live holder at least once
    busy_waits: AtomicU64,
    /// Grants issued without the accelerator after a full cycle of waiting
    degraded_count: AtomicU64,
    recent_waits: Mutex<VecDeque<u64>>,
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self {
            grants: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
            max_wait_ms: AtomicU64::new(0),
            contention_count: AtomicU64::new(0),
            busy_waits: AtomicU64::new(0),
            degraded_count: AtomicU64::new(0),
            recent_waits: Mutex::new(VecDeque::with_capacity(RECENT_WINDOW_SIZE)),
        }
    }
}

impl SchedulerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the total time a grant spent waiting
    pub fn record_wait(&self, wait_ms: u64) {
        self.grants.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ms.fetch_add(wait_ms, Ordering::Relaxed);
        self.max_wait_ms.fetch_max(wait_ms, Ordering::Relaxed);

        if let Ok(mut window) = self.recent_waits.lock() {
            window.push_back(wait_ms);
            if window.len() > RECENT_WINDOW_SIZE {
                window.pop_front();
            }
        }
    }

    pub fn record_reclaim(&self) {
        self.contention_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_busy(&self) {
        self.busy_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded(&self) {
        self.degraded_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn contention_count(&self) -> u64 {
        self.contention_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        let grants = self.grants.load(Ordering::Relaxed);
        let total = self.total_wait_ms.load(Ordering::Relaxed);
        let mut window: Vec<u64> = self
            .recent_waits
            .lock()
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default();
        window.sort_unstable();

        SchedulerStatsSnapshot {
            grants,
            avg_wait_ms: if grants == 0 {
                0.0
            } else {
                total as f64 / grants as f64
            },
            max_wait_ms: self.max_wait_ms.load(Ordering::Relaxed),
            p50_wait_ms: percentile(&window, 50.0),
            p95_wait_ms: percentile(&window, 95.0),
            p99_wait_ms: percentile(&window, 99.0),
            contention_count: self.contention_count.load(Ordering::Relaxed),
            busy_waits: self.busy_waits.load(Ordering::Relaxed),
            degraded_count: self.degraded_count.load(Ordering::Relaxed),
        }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.grants.store(0, Ordering::Relaxed);
        self.total_wait_ms.store(0, Ordering::Relaxed);
        self.max_wait_ms.store(0, Ordering::Relaxed);
        self.contention_count.store(0, Ordering::Relaxed);
        self.busy_waits.store(0, Ordering::Relaxed);
        self.degraded_count.store(0, Ordering::Relaxed);
        if let Ok(mut window) = self.recent_waits.lock() {
            window.clear();
        }
    }
}

// Nearest-rank percentile over an already sorted slice.
fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Point-in-time copy of [`SchedulerStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStatsSnapshot {
    pub grants: u64,
    pub avg_wait_ms: f64,
    pub max_wait_ms: u64,
    pub p50_wait_ms: u64,
    pub p95_wait_ms: u64,
    pub p99_wait_ms: u64,
    pub contention_count: u64,
    pub busy_waits: u64,
    pub degraded_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let stats = SchedulerStats::new();
        let snap = stats.snapshot();
        assert_eq!(snap.grants, 0);
        assert_eq!(snap.avg_wait_ms, 0.0);
        assert_eq!(snap.p99_wait_ms, 0);
    }

    #[test]
    fn test_wait_aggregates() {
        let stats = SchedulerStats::new();
        for wait in [0, 100, 200, 300] {
            stats.record_wait(wait);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.grants, 4);
        assert_eq!(snap.avg_wait_ms, 150.0);
        assert_eq!(snap.max_wait_ms, 300);
        assert_eq!(snap.p50_wait_ms, 100);
        assert_eq!(snap.p99_wait_ms, 300);
    }

    #[test]
    fn test_percentiles_over_window() {
        let stats = SchedulerStats::new();
        for wait in 1..=100 {
            stats.record_wait(wait);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.p50_wait_ms, 50);
        assert_eq!(snap.p95_wait_ms, 95);
        assert_eq!(snap.p99_wait_ms, 99);
    }

    #[test]
    fn test_window_is_bounded() {
        let stats = SchedulerStats::new();
        for _ in 0..(RECENT_WINDOW_SIZE * 2) {
            stats.record_wait(1);
        }
        assert_eq!(
            stats.recent_waits.lock().unwrap().len(),
            RECENT_WINDOW_SIZE
        );
    }

    #[test]
    fn test_counters_and_reset() {
        let stats = SchedulerStats::new();
        stats.record_reclaim();
        stats.record_busy();
        stats.record_degraded();
        stats.record_wait(10);
        assert_eq!(stats.contention_count(), 1);

        stats.reset();
        assert_eq!(stats.snapshot(), SchedulerStatsSnapshot::default());
    }
}
