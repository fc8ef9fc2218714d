//! Error types for the noise stream service

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for noise stream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the supervision core
///
/// None of these are fatal to the service: a channel that fails to spawn or
/// stalls is restarted by its own supervisor, and the HTTP layer maps the
/// rest onto status codes.
#[derive(Debug, Error)]
pub enum Error {
    /// Encoder binary could not be launched (missing executable, permissions)
    #[error("Failed to spawn encoder for channel {channel}: {source}")]
    Spawn {
        /// Channel the encoder belongs to
        channel: String,
        /// Underlying launch failure
        #[source]
        source: std::io::Error,
    },

    /// Playlist has not advanced within the staleness window
    #[error("Channel {channel} stalled: playlist unchanged for {stale_for:?} (limit {limit:?})")]
    Stall {
        /// Stalled channel
        channel: String,
        /// Time since the playlist was last written
        stale_for: Duration,
        /// Configured staleness limit
        limit: Duration,
    },

    /// Unknown channel id or a file that is not (or no longer) in the window
    #[error("{0} not found")]
    NotFound(String),

    /// Channel did not reach STOPPED within the shutdown window
    #[error("Channel {channel} did not stop within {timeout:?}")]
    ShutdownTimeout {
        /// Channel that was force-killed
        channel: String,
        /// Overall shutdown timeout
        timeout: Duration,
    },

    /// Requested HLS file name is not acceptable
    #[error("Invalid file name: {0}")]
    InvalidFileName(String),

    /// The supervisor task for a channel is no longer running
    #[error("Supervisor for channel {0} is not running")]
    SupervisorGone(String),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short machine-readable error kind used in API responses
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Spawn { .. } => "spawn_failed",
            Error::Stall { .. } => "stalled",
            Error::NotFound(_) => "not_found",
            Error::ShutdownTimeout { .. } => "shutdown_timeout",
            Error::InvalidFileName(_) => "invalid_file_name",
            Error::SupervisorGone(_) => "supervisor_gone",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }

    /// Whether this error means "nothing there" rather than a failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_message_names_channel() {
        let err = Error::Spawn {
            channel: "noise_pink".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.to_string().contains("noise_pink"));
        assert_eq!(err.kind(), "spawn_failed");
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_not_found_kind() {
        let err = Error::NotFound("Stream doesnotexist".to_string());
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Stream doesnotexist not found");
    }
}
