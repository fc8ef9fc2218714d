//! Health evaluation
//!
//! Health is never stored. It is derived on demand from a channel's status
//! snapshot and its playlist staleness.

use serde::Serialize;
use std::time::Duration;

use crate::channel::{ChannelState, NoiseColor};
use crate::supervisor::ChannelStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

/// Thresholds used when aggregating health
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub min_running_fraction: f64,
    pub crash_loop_threshold: u32,
}

/// Health of one channel
#[derive(Debug, Clone, Serialize)]
pub struct ChannelHealth {
    pub stream_id: String,
    pub noise_type: NoiseColor,
    pub status: HealthStatus,
    pub state: ChannelState,
    pub process_running: bool,
    /// A playlist exists on disk
    pub hls_available: bool,
    /// The playlist was written within the staleness limit
    pub manifest_fresh: bool,
    pub staleness_s: Option<f64>,
    pub restarts: u64,
    pub backoff_exponent: u32,
    pub crash_looping: bool,
    pub error: Option<String>,
}

impl ChannelHealth {
    pub fn evaluate(status: &ChannelStatus, stale_after: Duration, policy: &HealthPolicy) -> Self {
        let snapshot = &status.snapshot;
        let manifest_fresh = status
            .staleness_s
            .map(|s| s <= stale_after.as_secs_f64())
            .unwrap_or(false);
        let crash_looping = snapshot.backoff_exponent >= policy.crash_loop_threshold;

        let health = if crash_looping {
            HealthStatus::Unhealthy
        } else if snapshot.state == ChannelState::Running && manifest_fresh {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        };

        Self {
            stream_id: status.stream_id.clone(),
            noise_type: status.noise_type,
            status: health,
            state: snapshot.state,
            process_running: snapshot.pid.is_some(),
            hls_available: status.staleness_s.is_some(),
            manifest_fresh,
            staleness_s: status.staleness_s,
            restarts: snapshot.restarts,
            backoff_exponent: snapshot.backoff_exponent,
            crash_looping,
            error: snapshot.last_error.clone(),
        }
    }
}

/// Counts behind the overall status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub running: usize,
    pub healthy: usize,
    pub crash_looping: usize,
}

/// Aggregated health of every channel
#[derive(Debug, Clone, Serialize)]
pub struct RegistryHealth {
    pub status: HealthStatus,
    pub summary: HealthSummary,
    pub channels: Vec<ChannelHealth>,
}

impl RegistryHealth {
    /// `ok` iff enough channels run and none is crash-looping
    pub fn aggregate(channels: Vec<ChannelHealth>, policy: &HealthPolicy) -> Self {
        let summary = HealthSummary {
            total: channels.len(),
            running: channels
                .iter()
                .filter(|c| c.state == ChannelState::Running)
                .count(),
            healthy: channels
                .iter()
                .filter(|c| c.status == HealthStatus::Ok)
                .count(),
            crash_looping: channels.iter().filter(|c| c.crash_looping).count(),
        };

        let status = if summary.total == 0 || summary.crash_looping > 0 {
            HealthStatus::Degraded
        } else if summary.running as f64 / summary.total as f64 >= policy.min_running_fraction {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        };

        Self {
            status,
            summary,
            channels,
        }
    }
}
