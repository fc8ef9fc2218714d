//! Restart backoff policy
//!
//! Backoff state is plain data: the supervisor records each crash cycle in a
//! [`RestartState`] and asks the [`BackoffPolicy`] how long to wait. Nothing
//! here sleeps, so the arithmetic is testable without timers.

use rand::Rng;
use std::time::Duration;

use crate::config::SupervisorConfig;

/// Fraction of the delay used as jitter (±25%)
const DEFAULT_JITTER: f64 = 0.25;

/// Exponential backoff with jitter and a ceiling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for the first restart
    pub base: Duration,
    /// Delays never exceed this
    pub max: Duration,
    /// Jitter as a fraction of the un-jittered delay
    pub jitter: f64,
    /// Sustained RUNNING time after which the exponent resets
    pub stable_after: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            jitter: DEFAULT_JITTER,
            stable_after: config.stable_after(),
        }
    }

    /// `min(base * 2^exponent, max)`
    pub fn base_delay(&self, exponent: u32) -> Duration {
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay with jitter applied; `sample` is clamped to `-1.0..=1.0`
    pub fn delay(&self, exponent: u32, sample: f64) -> Duration {
        let delay = self.base_delay(exponent).as_secs_f64();
        let offset = delay * self.jitter * sample.clamp(-1.0, 1.0);
        Duration::from_secs_f64((delay + offset).max(0.0)).min(self.max)
    }

    /// Delay with a random jitter sample
    pub fn jittered(&self, exponent: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay(exponent, sample)
    }
}

/// Restart counters owned by one supervisor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestartState {
    /// Crash cycles over the supervisor's lifetime; never reset
    pub restarts: u64,
    /// Exponent for the next delay; reset after a stable run
    pub exponent: u32,
}

impl RestartState {
    /// Count one crash cycle; returns the exponent to use for its delay
    pub fn record_failure(&mut self) -> u32 {
        let exponent = self.exponent;
        self.restarts += 1;
        self.exponent = self.exponent.saturating_add(1);
        exponent
    }

    /// Forget past flaps after a sustained healthy run
    ///
    /// Returns `true` if the exponent actually changed.
    pub fn reset_exponent(&mut self) -> bool {
        let changed = self.exponent != 0;
        self.exponent = 0;
        changed
    }
}
