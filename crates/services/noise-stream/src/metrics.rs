//! Metrics collection for the noise stream service
//!
//! Process-wide counters for encoder lifecycle events and HLS traffic.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Service metrics collector
#[derive(Default)]
pub struct Metrics {
    /// Encoder processes successfully spawned
    encoder_spawns: AtomicU64,

    /// Encoder launches that failed outright
    spawn_failures: AtomicU64,

    /// Encoders that exited on their own
    crashes: AtomicU64,

    /// Channels whose playlist stopped advancing
    stalls: AtomicU64,

    /// Crash cycles that entered backoff
    restarts: AtomicU64,

    /// HLS file requests served or attempted
    hls_requests: AtomicU64,

    /// HLS requests answered with 404
    hls_not_found: AtomicU64,

    /// Startup timestamp (unix seconds)
    startup_time: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            startup_time: AtomicU64::new(unix_now()),
            ..Default::default()
        }
    }

    pub fn encoder_spawned(&self) {
        self.encoder_spawns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn spawn_failed(&self) {
        self.spawn_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn encoder_crashed(&self) {
        self.crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_stalled(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn restart_scheduled(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hls_requested(&self) {
        self.hls_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hls_missing(&self) {
        self.hls_not_found.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime_secs = unix_now().saturating_sub(self.startup_time.load(Ordering::Relaxed));

        MetricsSnapshot {
            encoder_spawns: self.encoder_spawns.load(Ordering::Relaxed),
            spawn_failures: self.spawn_failures.load(Ordering::Relaxed),
            crashes: self.crashes.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            hls_requests: self.hls_requests.load(Ordering::Relaxed),
            hls_not_found: self.hls_not_found.load(Ordering::Relaxed),
            uptime_secs,
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Snapshot of current metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub encoder_spawns: u64,
    pub spawn_failures: u64,
    pub crashes: u64,
    pub stalls: u64,
    pub restarts: u64,
    pub hls_requests: u64,
    pub hls_not_found: u64,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

/// Global metrics instance
static GLOBAL_METRICS: std::sync::OnceLock<Arc<Metrics>> = std::sync::OnceLock::new();

/// Get the global metrics instance
pub fn global_metrics() -> Arc<Metrics> {
    GLOBAL_METRICS
        .get_or_init(|| Arc::new(Metrics::new()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let snapshot = Metrics::new().snapshot();
        assert_eq!(snapshot.encoder_spawns, 0);
        assert_eq!(snapshot.restarts, 0);
        assert_eq!(snapshot.hls_not_found, 0);
    }

    #[test]
    fn test_lifecycle_counters() {
        let metrics = Metrics::new();

        metrics.encoder_spawned();
        metrics.encoder_crashed();
        metrics.restart_scheduled();
        metrics.encoder_spawned();
        metrics.channel_stalled();
        metrics.restart_scheduled();
        metrics.spawn_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.encoder_spawns, 2);
        assert_eq!(snapshot.crashes, 1);
        assert_eq!(snapshot.stalls, 1);
        assert_eq!(snapshot.restarts, 2);
        assert_eq!(snapshot.spawn_failures, 1);
    }

    #[test]
    fn test_hls_counters() {
        let metrics = Metrics::new();
        for _ in 0..4 {
            metrics.hls_requested();
        }
        metrics.hls_missing();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hls_requests, 4);
        assert_eq!(snapshot.hls_not_found, 1);
    }

    #[test]
    fn test_global_metrics() {
        let m1 = global_metrics();
        let m2 = global_metrics();

        m1.hls_requested();
        assert_eq!(m2.snapshot().hls_requests, m1.snapshot().hls_requests);
    }
}
