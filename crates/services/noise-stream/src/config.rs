//! Configuration for the noise stream service
//!
//! Configuration can be loaded from a TOML file and/or environment variables.
//! It is read once at startup and never reloaded.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::channel::{ChannelSpec, NoiseColor};

/// Environment variable naming an optional TOML config file
pub const CONFIG_PATH_ENV: &str = "NOISE_STREAM_CONFIG";

/// Upper bound keeping the staleness limit representable as a `Duration`
pub const MAX_STALENESS_MULTIPLIER: f64 = 1000.0;

/// Main configuration for the noise stream service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Encoder invocation parameters shared by every channel
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Which channels exist and where they write
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Liveness and restart policy
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Encoder executable (looked up in PATH when not absolute)
    #[serde(default = "default_program")]
    pub program: String,

    /// Output sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Audio bitrate passed verbatim to the encoder (e.g. "128k")
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,

    /// Target segment duration in seconds
    #[serde(default = "default_segment_time")]
    pub segment_time: u64,

    /// Number of segments kept in the playlist
    #[serde(default = "default_list_size")]
    pub list_size: u32,
}

fn default_program() -> String {
    "ffmpeg".to_string()
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_audio_bitrate() -> String {
    "128k".to_string()
}

fn default_segment_time() -> u64 {
    2
}

fn default_list_size() -> u32 {
    5
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            sample_rate: default_sample_rate(),
            audio_bitrate: default_audio_bitrate(),
            segment_time: default_segment_time(),
            list_size: default_list_size(),
        }
    }
}

/// Channel set configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Noise colors (or `noise_<color>` ids), one channel each
    #[serde(default = "default_noise_types")]
    pub noise_types: Vec<String>,

    /// Root directory; each channel writes to `<hls_dir>/<channel id>`
    #[serde(default = "default_hls_dir")]
    pub hls_dir: PathBuf,
}

fn default_noise_types() -> Vec<String> {
    vec!["white".to_string(), "pink".to_string(), "brown".to_string()]
}

fn default_hls_dir() -> PathBuf {
    PathBuf::from("/app/hls")
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            noise_types: default_noise_types(),
            hls_dir: default_hls_dir(),
        }
    }
}

/// Supervision policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Interval between liveness checks in milliseconds
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Playlist is stale after `segment_time * staleness_multiplier`
    #[serde(default = "default_staleness_multiplier")]
    pub staleness_multiplier: f64,

    /// First restart delay in milliseconds
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Upper bound on restart delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Sustained RUNNING time after which the backoff exponent resets
    #[serde(default = "default_stable_after_secs")]
    pub stable_after_secs: u64,

    /// Grace period between SIGTERM and SIGKILL in milliseconds
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Overall bound on service shutdown in milliseconds
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Fraction of channels that must be RUNNING for overall `ok`
    #[serde(default = "default_min_running_fraction")]
    pub min_running_fraction: f64,

    /// Backoff exponent at which a channel counts as crash-looping
    #[serde(default = "default_crash_loop_threshold")]
    pub crash_loop_threshold: u32,
}

fn default_check_interval_ms() -> u64 {
    2000
}

fn default_staleness_multiplier() -> f64 {
    3.0
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_stable_after_secs() -> u64 {
    60
}

fn default_stop_grace_ms() -> u64 {
    5000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_min_running_fraction() -> f64 {
    1.0
}

fn default_crash_loop_threshold() -> u32 {
    5
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            staleness_multiplier: default_staleness_multiplier(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            stable_after_secs: default_stable_after_secs(),
            stop_grace_ms: default_stop_grace_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            min_running_fraction: default_min_running_fraction(),
            crash_loop_threshold: default_crash_loop_threshold(),
        }
    }
}

impl SupervisorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_secs(self.stable_after_secs)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Human-readable or JSON lines
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source
    ///
    /// Unparseable or out-of-range numbers keep their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        // Server
        if let Some(host) = lookup("HOST") {
            config.server.host = host;
        }
        if let Some(port) = parse_at_least::<u16>(&lookup, "PORT", 1) {
            config.server.port = port;
        }

        // Encoder
        if let Some(program) = lookup("ENCODER_PROGRAM") {
            config.encoder.program = program;
        }
        if let Some(rate) = parse_at_least(&lookup, "SAMPLE_RATE", 8000) {
            config.encoder.sample_rate = rate;
        }
        if let Some(bitrate) = lookup("AUDIO_BITRATE") {
            config.encoder.audio_bitrate = bitrate;
        }
        if let Some(t) = parse_at_least(&lookup, "SEGMENT_TIME", 1) {
            config.encoder.segment_time = t;
        }
        if let Some(n) = parse_at_least(&lookup, "LIST_SIZE", 1) {
            config.encoder.list_size = n;
        }

        // Channels
        if let Some(types) = lookup("NOISE_TYPES") {
            config.channels.noise_types = split_list(&types);
        }
        if let Some(dir) = lookup("HLS_DIR") {
            config.channels.hls_dir = PathBuf::from(dir);
        }

        // Supervisor
        if let Some(ms) = parse_at_least(&lookup, "NOISE_CHECK_INTERVAL_MS", 10) {
            config.supervisor.check_interval_ms = ms;
        }
        if let Some(m) = parse_at_least(&lookup, "NOISE_STALENESS_MULTIPLIER", 1.0) {
            config.supervisor.staleness_multiplier = m;
        }
        if let Some(ms) = parse_at_least(&lookup, "NOISE_BASE_BACKOFF_MS", 1) {
            config.supervisor.base_backoff_ms = ms;
        }
        if let Some(ms) = parse_at_least(&lookup, "NOISE_MAX_BACKOFF_MS", 1) {
            config.supervisor.max_backoff_ms = ms;
        }
        if let Some(s) = parse_at_least(&lookup, "NOISE_STABLE_AFTER_SECS", 1) {
            config.supervisor.stable_after_secs = s;
        }
        if let Some(ms) = parse_at_least(&lookup, "NOISE_STOP_GRACE_MS", 0) {
            config.supervisor.stop_grace_ms = ms;
        }
        if let Some(ms) = parse_at_least(&lookup, "NOISE_SHUTDOWN_TIMEOUT_MS", 0) {
            config.supervisor.shutdown_timeout_ms = ms;
        }
        if let Some(f) = parse_at_least(&lookup, "NOISE_MIN_RUNNING_FRACTION", 0.0) {
            if f <= 1.0 {
                config.supervisor.min_running_fraction = f;
            }
        }
        if let Some(n) = parse_at_least(&lookup, "NOISE_CRASH_LOOP_THRESHOLD", 1) {
            config.supervisor.crash_loop_threshold = n;
        }

        // Logging
        if let Some(level) = lookup("LOG_LEVEL") {
            config.logging.level = level.to_lowercase();
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            if format.eq_ignore_ascii_case("json") {
                config.logging.format = LogFormat::Json;
            }
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
        }
        Ok(Self::from_env())
    }

    /// Reject configurations the supervisor cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encoder.segment_time == 0 {
            return Err(ConfigError::Invalid("encoder.segment_time must be at least 1".into()));
        }
        if self.encoder.list_size == 0 {
            return Err(ConfigError::Invalid("encoder.list_size must be at least 1".into()));
        }
        if self.encoder.sample_rate < 8000 {
            return Err(ConfigError::Invalid("encoder.sample_rate must be at least 8000".into()));
        }
        let sup = &self.supervisor;
        if sup.check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.check_interval_ms must be positive".into(),
            ));
        }
        if !(1.0..=MAX_STALENESS_MULTIPLIER).contains(&sup.staleness_multiplier) {
            return Err(ConfigError::Invalid(format!(
                "supervisor.staleness_multiplier must be within 1.0..={}",
                MAX_STALENESS_MULTIPLIER
            )));
        }
        let stale_after = self.encoder.segment_time as f64 * sup.staleness_multiplier;
        if Duration::try_from_secs_f64(stale_after).is_err() {
            return Err(ConfigError::Invalid(
                "encoder.segment_time is too large for the staleness limit".into(),
            ));
        }
        if sup.base_backoff_ms == 0 || sup.max_backoff_ms < sup.base_backoff_ms {
            return Err(ConfigError::Invalid(
                "supervisor backoff requires 0 < base_backoff_ms <= max_backoff_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&sup.min_running_fraction) {
            return Err(ConfigError::Invalid(
                "supervisor.min_running_fraction must be within 0.0..=1.0".into(),
            ));
        }
        self.channel_specs().map(|_| ())
    }

    /// Expand `channels.noise_types` into one spec per channel, in configured order
    pub fn channel_specs(&self) -> Result<Vec<ChannelSpec>, ConfigError> {
        let mut seen = HashSet::new();
        let mut specs = Vec::new();

        for entry in &self.channels.noise_types {
            let color = NoiseColor::from_str(entry)?;
            if !seen.insert(color) {
                continue;
            }
            specs.push(ChannelSpec::new(color, &self.encoder));
        }

        if specs.is_empty() {
            return Err(ConfigError::Invalid("no channels configured".into()));
        }
        Ok(specs)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn parse_at_least<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, min: T) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    lookup(name)
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .filter(|value| *value >= min)
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown noise type: {0}")]
    UnknownNoise(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.encoder.sample_rate, 44100);
        assert_eq!(config.encoder.segment_time, 2);
        assert_eq!(config.encoder.list_size, 5);
        assert_eq!(config.channels.noise_types, vec!["white", "pink", "brown"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[server]
port = 9090

[encoder]
segment_time = 4
audio_bitrate = "96k"

[channels]
noise_types = ["white", "noise_brown"]
hls_dir = "/tmp/hls"

[supervisor]
staleness_multiplier = 5.0
base_backoff_ms = 250

[logging]
format = "json"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.encoder.segment_time, 4);
        assert_eq!(config.encoder.audio_bitrate, "96k");
        assert_eq!(config.channels.hls_dir, PathBuf::from("/tmp/hls"));
        assert_eq!(config.supervisor.staleness_multiplier, 5.0);
        assert_eq!(config.supervisor.base_backoff_ms, 250);
        assert_eq!(config.supervisor.max_backoff_ms, 30_000);
        assert_eq!(config.logging.format, LogFormat::Json);

        let ids: Vec<String> = config
            .channel_specs()
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["noise_white", "noise_brown"]);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("PORT", "8123"),
            ("NOISE_TYPES", " White, ,pink "),
            ("SEGMENT_TIME", "6"),
            ("HLS_DIR", "/var/hls"),
            ("LOG_LEVEL", "DEBUG"),
        ]));
        assert_eq!(config.server.port, 8123);
        assert_eq!(config.channels.noise_types, vec!["white", "pink"]);
        assert_eq!(config.encoder.segment_time, 6);
        assert_eq!(config.channels.hls_dir, PathBuf::from("/var/hls"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_invalid_env_values_fall_back_to_defaults() {
        let config = Config::from_lookup(lookup_from(&[
            ("PORT", "70000"),
            ("SAMPLE_RATE", "4000"),
            ("LIST_SIZE", "zero"),
            ("SEGMENT_TIME", "0"),
            ("NOISE_MIN_RUNNING_FRACTION", "1.5"),
        ]));
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.encoder.sample_rate, 44100);
        assert_eq!(config.encoder.list_size, 5);
        assert_eq!(config.encoder.segment_time, 2);
        assert_eq!(config.supervisor.min_running_fraction, 1.0);
    }

    #[test]
    fn test_validate_rejects_unknown_noise() {
        let mut config = Config::default();
        config.channels.noise_types = vec!["white".into(), "plaid".into()];
        match config.validate() {
            Err(ConfigError::UnknownNoise(name)) => assert_eq!(name, "plaid"),
            other => panic!("expected UnknownNoise, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_empty_channel_list() {
        let mut config = Config::default();
        config.channels.noise_types.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_channels_collapse() {
        let mut config = Config::default();
        config.channels.noise_types = vec!["pink".into(), "noise_pink".into()];
        assert_eq!(config.channel_specs().unwrap().len(), 1);
    }

    #[test]
    fn test_backoff_bounds_validated() {
        let mut config = Config::default();
        config.supervisor.base_backoff_ms = 5000;
        config.supervisor.max_backoff_ms = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_staleness_multiplier_bounds_validated() {
        for m in [0.5, f64::NAN, f64::INFINITY, 1e300, MAX_STALENESS_MULTIPLIER + 1.0] {
            let mut config = Config::default();
            config.supervisor.staleness_multiplier = m;
            assert!(config.validate().is_err(), "multiplier {} accepted", m);
        }

        let mut config = Config::default();
        config.supervisor.staleness_multiplier = MAX_STALENESS_MULTIPLIER;
        assert!(config.validate().is_ok());

        config.encoder.segment_time = u64::MAX;
        assert!(config.validate().is_err());
    }
}
