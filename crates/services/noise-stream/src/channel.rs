//! Channel identity, parameters and lifecycle snapshot
//!
//! A channel is one independently supervised noise stream. Its parameters are
//! fixed at startup; only the lifecycle snapshot changes afterwards.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::{ConfigError, EncoderConfig};
use crate::segment::PLAYLIST_NAME;

/// Prefix shared by every channel id (`noise_white`, `noise_pink`, ...)
pub const CHANNEL_ID_PREFIX: &str = "noise_";

/// Noise colors the encoder's noise source can generate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseColor {
    White,
    Pink,
    Brown,
    Blue,
    Violet,
    Velvet,
}

impl NoiseColor {
    pub const ALL: [NoiseColor; 6] = [
        NoiseColor::White,
        NoiseColor::Pink,
        NoiseColor::Brown,
        NoiseColor::Blue,
        NoiseColor::Violet,
        NoiseColor::Velvet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NoiseColor::White => "white",
            NoiseColor::Pink => "pink",
            NoiseColor::Brown => "brown",
            NoiseColor::Blue => "blue",
            NoiseColor::Violet => "violet",
            NoiseColor::Velvet => "velvet",
        }
    }

    /// Channel id for this color
    pub fn channel_id(&self) -> String {
        format!("{}{}", CHANNEL_ID_PREFIX, self.as_str())
    }
}

impl fmt::Display for NoiseColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoiseColor {
    type Err = ConfigError;

    /// Accepts either a bare color (`pink`) or a channel id (`noise_pink`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        let color = normalized
            .strip_prefix(CHANNEL_ID_PREFIX)
            .unwrap_or(&normalized);

        NoiseColor::ALL
            .into_iter()
            .find(|c| c.as_str() == color)
            .ok_or_else(|| ConfigError::UnknownNoise(s.trim().to_string()))
    }
}

/// Static parameters of one channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSpec {
    /// Channel id, e.g. `noise_white`
    pub id: String,
    pub color: NoiseColor,
    pub sample_rate: u32,
    pub audio_bitrate: String,
    /// Target segment duration in seconds
    pub segment_time: u64,
    /// Segments referenced by the playlist
    pub list_size: u32,
}

impl ChannelSpec {
    pub fn new(color: NoiseColor, encoder: &EncoderConfig) -> Self {
        Self {
            id: color.channel_id(),
            color,
            sample_rate: encoder.sample_rate,
            audio_bitrate: encoder.audio_bitrate.clone(),
            segment_time: encoder.segment_time,
            list_size: encoder.list_size,
        }
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_time)
    }

    /// Public URL of the channel's playlist
    pub fn stream_url(&self) -> String {
        format!("/hls/{}/{}", self.id, PLAYLIST_NAME)
    }
}

/// Lifecycle state of a channel supervisor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Stopped,
    Starting,
    Running,
    Degraded,
    Crashed,
    Backoff,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Stopped => "stopped",
            ChannelState::Starting => "starting",
            ChannelState::Running => "running",
            ChannelState::Degraded => "degraded",
            ChannelState::Crashed => "crashed",
            ChannelState::Backoff => "backoff",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the last encoder instance was given up on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The encoder binary could not be launched
    Spawn,
    /// The encoder process exited on its own
    Exited,
    /// The playlist stopped advancing
    Stalled,
}

/// Point-in-time view of a channel, published by its supervisor task
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    pub state: ChannelState,

    /// PID of the current encoder, if one is alive
    pub pid: Option<u32>,

    /// Crash cycles over the supervisor's lifetime
    pub restarts: u64,

    /// Exponent used for the next backoff delay
    pub backoff_exponent: u32,

    pub last_failure: Option<FailureKind>,
    pub last_exit_code: Option<i32>,
    pub last_error: Option<String>,

    /// When the current encoder was spawned
    pub started_at: Option<DateTime<Utc>>,

    /// When the current encoder first produced a playlist
    pub running_since: Option<DateTime<Utc>>,

    /// Last liveness check that found the channel fresh
    pub last_healthy_at: Option<DateTime<Utc>>,

    /// Scheduled restart time while in BACKOFF
    pub next_attempt_at: Option<DateTime<Utc>>,
}
