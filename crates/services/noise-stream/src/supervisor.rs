//! Channel supervisor
//!
//! One tokio task per channel owns the encoder process and every piece of
//! mutable lifecycle state. Callers talk to it through [`ChannelSupervisor`],
//! which forwards start/stop requests over an mpsc channel and reads the
//! latest [`ChannelSnapshot`] from a `watch` channel.
//!
//! ```text
//!  STOPPED ──start──▶ STARTING ──playlist written──▶ RUNNING
//!                        │                              │
//!                        └──── exited / stalled ────────┤
//!                                                       ▼
//!                    STARTING ◀── delay ── BACKOFF ◀── CRASHED | DEGRADED
//! ```
//!
//! Any state goes to STOPPED on an explicit stop.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::backoff::{BackoffPolicy, RestartState};
use crate::channel::{ChannelSnapshot, ChannelSpec, ChannelState, FailureKind, NoiseColor};
use crate::clock::Clock;
use crate::config::SupervisorConfig;
use crate::encoder::{exit_code, EncoderLauncher, EncoderProcess};
use crate::error::{Error, Result};
use crate::metrics::global_metrics;
use crate::segment::ChannelDir;

/// Timing knobs for one supervisor
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// Interval between liveness checks
    pub check_interval: Duration,
    /// Playlist age after which the channel counts as stalled
    pub stale_after: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace: Duration,
    pub backoff: BackoffPolicy,
}

impl SupervisorSettings {
    pub fn for_channel(spec: &ChannelSpec, config: &SupervisorConfig) -> Self {
        Self {
            check_interval: config.check_interval(),
            stale_after: spec
                .segment_duration()
                .mul_f64(config.staleness_multiplier),
            stop_grace: config.stop_grace(),
            backoff: BackoffPolicy::from_config(config),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new encoder was spawned
    Started,
    /// The channel was already STARTING or RUNNING
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    WasNotRunning,
}

/// Snapshot plus the values derived from the segment store
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub stream_id: String,
    pub noise_type: NoiseColor,
    #[serde(flatten)]
    pub snapshot: ChannelSnapshot,
    /// Seconds since the playlist was last written
    pub staleness_s: Option<f64>,
    pub stream_url: String,
}

impl ChannelStatus {
    pub fn state(&self) -> ChannelState {
        self.snapshot.state
    }
}

enum Request {
    Start {
        reply: oneshot::Sender<Result<StartOutcome>>,
    },
    Stop {
        reply: oneshot::Sender<StopOutcome>,
    },
}

/// Handle to one channel's supervisor task
///
/// Dropping the handle stops the channel; [`ChannelSupervisor::abort`] kills
/// it without a graceful stop.
pub struct ChannelSupervisor {
    spec: ChannelSpec,
    dir: ChannelDir,
    settings: SupervisorSettings,
    clock: Arc<dyn Clock>,
    requests: mpsc::Sender<Request>,
    snapshot: watch::Receiver<ChannelSnapshot>,
    publisher: Arc<watch::Sender<ChannelSnapshot>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelSupervisor {
    /// Spawn the supervisor task; the channel starts out STOPPED
    pub fn spawn(
        spec: ChannelSpec,
        dir: ChannelDir,
        launcher: Arc<dyn EncoderLauncher>,
        settings: SupervisorSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(16);
        let (snapshot_tx, snapshot_rx) = watch::channel(ChannelSnapshot::default());
        let publisher = Arc::new(snapshot_tx);

        let worker = Worker {
            spec: spec.clone(),
            dir: dir.clone(),
            settings,
            launcher,
            clock: clock.clone(),
            snapshot: publisher.clone(),
            restarts: RestartState::default(),
            phase: Phase::Stopped,
            encoder: None,
        };
        let task = tokio::spawn(worker.run(requests_rx));

        Self {
            spec,
            dir,
            settings,
            clock,
            requests: requests_tx,
            snapshot: snapshot_rx,
            publisher,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    pub fn dir(&self) -> &ChannelDir {
        &self.dir
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<ChannelSnapshot> {
        self.snapshot.clone()
    }

    /// Start the encoder unless it is already STARTING or RUNNING
    ///
    /// Cancels a pending backoff and attempts immediately. A launch failure
    /// is returned here and the channel keeps retrying with backoff.
    pub async fn start(&self) -> Result<StartOutcome> {
        let (reply, response) = oneshot::channel();
        self.send(Request::Start { reply }).await?;
        response.await.map_err(|_| self.gone())?
    }

    /// Stop the encoder and cancel any pending restart; idempotent
    pub async fn stop(&self) -> Result<StopOutcome> {
        let (reply, response) = oneshot::channel();
        self.send(Request::Stop { reply }).await?;
        response.await.map_err(|_| self.gone())
    }

    pub async fn status(&self) -> ChannelStatus {
        let snapshot = self.snapshot();
        let staleness_s = self
            .dir
            .staleness(self.clock.now())
            .await
            .map(|d| d.as_secs_f64());

        ChannelStatus {
            stream_id: self.spec.id.clone(),
            noise_type: self.spec.color,
            snapshot,
            staleness_s,
            stream_url: self.spec.stream_url(),
        }
    }

    /// Kill the task without a graceful stop; the encoder dies with it
    ///
    /// Publishes STOPPED once the task is gone, so the last snapshot never
    /// refers to a dead encoder.
    pub async fn abort(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            // Cancelled tasks resolve with a JoinError
            let _ = task.await;
        }

        self.publisher.send_modify(|s| {
            s.state = ChannelState::Stopped;
            s.pid = None;
            s.running_since = None;
            s.next_attempt_at = None;
        });
    }

    async fn send(&self, request: Request) -> Result<()> {
        self.requests.send(request).await.map_err(|_| self.gone())
    }

    fn gone(&self) -> Error {
        Error::SupervisorGone(self.spec.id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Starting { spawned_at: SystemTime },
    Running { since: SystemTime },
    Backoff { until: Instant },
}

/// Outcome of one liveness check, before the process exit status is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Nothing to do yet
    Waiting,
    /// First playlist write since spawn
    Started,
    Fresh,
    Stalled(Duration),
}

fn assess(
    phase: Phase,
    now: SystemTime,
    modified: Option<SystemTime>,
    stale_after: Duration,
) -> Verdict {
    let age = |since: SystemTime| now.duration_since(since).unwrap_or(Duration::ZERO);

    match phase {
        Phase::Starting { spawned_at } => match modified {
            Some(m) if m >= spawned_at => Verdict::Started,
            _ if age(spawned_at) > stale_after => Verdict::Stalled(age(spawned_at)),
            _ => Verdict::Waiting,
        },
        Phase::Running { since } => match modified {
            Some(m) if age(m) > stale_after => Verdict::Stalled(age(m)),
            Some(_) => Verdict::Fresh,
            // Playlist vanished underneath a running encoder
            None => Verdict::Stalled(age(since)),
        },
        Phase::Stopped | Phase::Backoff { .. } => Verdict::Waiting,
    }
}

struct Worker {
    spec: ChannelSpec,
    dir: ChannelDir,
    settings: SupervisorSettings,
    launcher: Arc<dyn EncoderLauncher>,
    clock: Arc<dyn Clock>,
    snapshot: Arc<watch::Sender<ChannelSnapshot>>,
    restarts: RestartState,
    phase: Phase,
    encoder: Option<EncoderProcess>,
}

impl Worker {
    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        let mut ticker = tokio::time::interval(self.settings.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = match self.phase {
                Phase::Backoff { until } => Some(until),
                _ => None,
            };

            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Start { reply }) => {
                        let _ = reply.send(self.start().await);
                    }
                    Some(Request::Stop { reply }) => {
                        let _ = reply.send(self.stop().await);
                    }
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                _ = sleep_until(retry_at) => {
                    tracing::info!(
                        channel = %self.spec.id,
                        restarts = self.restarts.restarts,
                        "Restarting encoder after backoff"
                    );
                    // Failures are already handled inside launch
                    let _ = self.launch().await;
                }
                _ = ticker.tick() => self.check().await,
            }
        }

        tracing::debug!(channel = %self.spec.id, "Supervisor task finished");
    }

    async fn start(&mut self) -> Result<StartOutcome> {
        if matches!(self.phase, Phase::Starting { .. } | Phase::Running { .. }) {
            return Ok(StartOutcome::AlreadyRunning);
        }
        self.launch().await?;
        Ok(StartOutcome::Started)
    }

    async fn launch(&mut self) -> Result<()> {
        self.reap().await;

        let spawned_at = self.clock.now();
        match EncoderProcess::spawn(self.launcher.as_ref(), &self.spec, &self.dir).await {
            Ok(process) => {
                global_metrics().encoder_spawned();
                let pid = process.pid();
                self.encoder = Some(process);
                self.phase = Phase::Starting { spawned_at };
                self.snapshot.send_modify(|s| {
                    s.state = ChannelState::Starting;
                    s.pid = pid;
                    s.started_at = Some(to_utc(spawned_at));
                    s.running_since = None;
                    s.next_attempt_at = None;
                });
                Ok(())
            }
            Err(e) => {
                global_metrics().spawn_failed();
                tracing::error!(channel = %self.spec.id, error = %e, "Failed to launch encoder");
                self.fail(FailureKind::Spawn, None, e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn stop(&mut self) -> StopOutcome {
        let outcome = if self.phase == Phase::Stopped && self.encoder.is_none() {
            StopOutcome::WasNotRunning
        } else {
            StopOutcome::Stopped
        };

        let exit = self.reap().await;
        self.phase = Phase::Stopped;
        self.restarts.reset_exponent();

        let exponent = self.restarts.exponent;
        self.snapshot.send_modify(|s| {
            s.state = ChannelState::Stopped;
            s.pid = None;
            s.backoff_exponent = exponent;
            s.running_since = None;
            s.next_attempt_at = None;
            if exit.is_some() {
                s.last_exit_code = exit;
            }
        });

        if outcome == StopOutcome::Stopped {
            tracing::info!(channel = %self.spec.id, "Channel stopped");
        }
        outcome
    }

    async fn check(&mut self) {
        if matches!(self.phase, Phase::Stopped | Phase::Backoff { .. }) {
            return;
        }

        if let Some(status) = self.encoder.as_mut().and_then(|e| e.try_exit()) {
            let code = exit_code(&status);
            let message = self
                .encoder
                .as_ref()
                .and_then(|e| e.last_error())
                .unwrap_or_else(|| format!("encoder exited with {}", status));
            tracing::warn!(
                channel = %self.spec.id,
                exit_code = ?code,
                "Encoder exited unexpectedly"
            );
            global_metrics().encoder_crashed();
            self.fail(FailureKind::Exited, code, message).await;
            return;
        }

        let now = self.clock.now();
        let modified = self.dir.playlist_modified().await;

        match assess(self.phase, now, modified, self.settings.stale_after) {
            Verdict::Waiting => {}
            Verdict::Started => {
                self.phase = Phase::Running { since: now };
                self.snapshot.send_modify(|s| {
                    s.state = ChannelState::Running;
                    s.running_since = Some(to_utc(now));
                    s.last_healthy_at = Some(to_utc(now));
                });
                tracing::info!(channel = %self.spec.id, "Channel running");
            }
            Verdict::Fresh => {
                let stable = match self.phase {
                    Phase::Running { since } => {
                        now.duration_since(since).unwrap_or(Duration::ZERO)
                            >= self.settings.backoff.stable_after
                    }
                    _ => false,
                };
                let reset = stable && self.restarts.reset_exponent();
                if reset {
                    tracing::info!(channel = %self.spec.id, "Channel stable, backoff reset");
                }
                let exponent = self.restarts.exponent;
                self.snapshot.send_modify(|s| {
                    s.last_healthy_at = Some(to_utc(now));
                    s.backoff_exponent = exponent;
                });
            }
            Verdict::Stalled(stale_for) => {
                let stall = Error::Stall {
                    channel: self.spec.id.clone(),
                    stale_for,
                    limit: self.settings.stale_after,
                };
                tracing::warn!(channel = %self.spec.id, error = %stall, "Channel degraded");
                global_metrics().channel_stalled();
                self.fail(FailureKind::Stalled, None, stall.to_string()).await;
            }
        }
    }

    /// Count the crash cycle, reap the encoder and schedule the next attempt
    async fn fail(&mut self, kind: FailureKind, exit_code: Option<i32>, message: String) {
        let transient = match kind {
            FailureKind::Stalled => ChannelState::Degraded,
            FailureKind::Exited | FailureKind::Spawn => ChannelState::Crashed,
        };

        let exponent = self.restarts.record_failure();
        let delay = self.settings.backoff.jittered(exponent);
        global_metrics().restart_scheduled();

        // Counters move together with the failure that caused them
        let restarts = self.restarts;
        self.snapshot.send_modify(|s| {
            s.state = transient;
            s.restarts = restarts.restarts;
            s.backoff_exponent = restarts.exponent;
            s.last_failure = Some(kind);
            s.last_error = Some(message);
            if exit_code.is_some() {
                s.last_exit_code = exit_code;
            }
        });

        self.reap().await;

        self.phase = Phase::Backoff {
            until: Instant::now() + delay,
        };
        let next_attempt = to_utc(self.clock.now() + delay);
        self.snapshot.send_modify(|s| {
            s.state = ChannelState::Backoff;
            s.pid = None;
            s.running_since = None;
            s.next_attempt_at = Some(next_attempt);
        });

        tracing::warn!(
            channel = %self.spec.id,
            restarts = restarts.restarts,
            delay_ms = delay.as_millis() as u64,
            "Channel in backoff"
        );
    }

    /// Terminate and reap the current encoder, if any; returns its exit code
    async fn reap(&mut self) -> Option<i32> {
        let process = self.encoder.take()?;
        let pid = process.pid();
        let termination = process.terminate(self.settings.stop_grace).await;
        tracing::debug!(channel = %self.spec.id, pid = ?pid, ?termination, "Encoder reaped");
        termination.exit_status().as_ref().and_then(exit_code)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    const STALE: Duration = Duration::from_secs(6);

    #[test]
    fn test_starting_waits_for_first_write_after_spawn() {
        let phase = Phase::Starting { spawned_at: at(100) };

        assert_eq!(assess(phase, at(102), None, STALE), Verdict::Waiting);
        // A playlist left over from an earlier encoder does not count
        assert_eq!(assess(phase, at(102), Some(at(90)), STALE), Verdict::Waiting);
        assert_eq!(assess(phase, at(102), Some(at(101)), STALE), Verdict::Started);
    }

    #[test]
    fn test_starting_stalls_without_first_write() {
        let phase = Phase::Starting { spawned_at: at(100) };
        assert_eq!(assess(phase, at(106), None, STALE), Verdict::Waiting);
        assert_eq!(
            assess(phase, at(107), Some(at(50)), STALE),
            Verdict::Stalled(Duration::from_secs(7))
        );
    }

    #[test]
    fn test_running_freshness() {
        let phase = Phase::Running { since: at(100) };

        assert_eq!(assess(phase, at(110), Some(at(108)), STALE), Verdict::Fresh);
        assert_eq!(assess(phase, at(110), Some(at(104)), STALE), Verdict::Fresh);
        assert_eq!(
            assess(phase, at(111), Some(at(104)), STALE),
            Verdict::Stalled(Duration::from_secs(7))
        );
        // Modification time ahead of the clock counts as fresh
        assert_eq!(assess(phase, at(110), Some(at(120)), STALE), Verdict::Fresh);
        assert_eq!(
            assess(phase, at(110), None, STALE),
            Verdict::Stalled(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_idle_phases_never_fail() {
        let backoff = Phase::Backoff {
            until: Instant::now(),
        };
        assert_eq!(assess(Phase::Stopped, at(1000), None, STALE), Verdict::Waiting);
        assert_eq!(assess(backoff, at(1000), Some(at(1)), STALE), Verdict::Waiting);
    }

    #[test]
    fn test_settings_scale_with_segment_time() {
        use crate::config::EncoderConfig;

        let encoder = EncoderConfig {
            segment_time: 4,
            ..Default::default()
        };
        let spec = ChannelSpec::new(NoiseColor::Velvet, &encoder);
        let config = SupervisorConfig {
            staleness_multiplier: 2.5,
            ..Default::default()
        };
        let settings = SupervisorSettings::for_channel(&spec, &config);
        assert_eq!(settings.stale_after, Duration::from_secs(10));
        assert_eq!(settings.check_interval, Duration::from_secs(2));
        assert_eq!(settings.backoff.base, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_spawn_failure_enters_backoff() {
        use crate::clock::SystemClock;
        use crate::config::EncoderConfig;
        use crate::encoder::FfmpegLauncher;
        use crate::segment::SegmentStore;

        let tmp = tempfile::tempdir().unwrap();
        let spec = ChannelSpec::new(NoiseColor::White, &EncoderConfig::default());
        let dir = SegmentStore::new(tmp.path()).channel(&spec.id);
        let config = SupervisorConfig {
            base_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            ..Default::default()
        };
        let settings = SupervisorSettings::for_channel(&spec, &config);

        let supervisor = ChannelSupervisor::spawn(
            spec,
            dir,
            Arc::new(FfmpegLauncher::new("/nonexistent/ffmpeg")),
            settings,
            Arc::new(SystemClock),
        );

        let err = supervisor.start().await.unwrap_err();
        assert_eq!(err.kind(), "spawn_failed");

        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state, ChannelState::Backoff);
        assert_eq!(snapshot.restarts, 1);
        assert_eq!(snapshot.backoff_exponent, 1);
        assert_eq!(snapshot.last_failure, Some(FailureKind::Spawn));
        assert!(snapshot.next_attempt_at.is_some());
        assert!(snapshot.pid.is_none());

        assert_eq!(supervisor.stop().await.unwrap(), StopOutcome::Stopped);
        assert_eq!(supervisor.stop().await.unwrap(), StopOutcome::WasNotRunning);
        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state, ChannelState::Stopped);
        assert!(snapshot.next_attempt_at.is_none());
        assert_eq!(snapshot.restarts, 1);
    }

    #[tokio::test]
    async fn test_abort_publishes_stopped() {
        use crate::clock::SystemClock;
        use crate::config::EncoderConfig;
        use crate::encoder::FfmpegLauncher;
        use crate::segment::SegmentStore;

        let tmp = tempfile::tempdir().unwrap();
        let spec = ChannelSpec::new(NoiseColor::Pink, &EncoderConfig::default());
        let dir = SegmentStore::new(tmp.path()).channel(&spec.id);
        let config = SupervisorConfig {
            base_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            ..Default::default()
        };
        let settings = SupervisorSettings::for_channel(&spec, &config);

        let supervisor = ChannelSupervisor::spawn(
            spec,
            dir,
            Arc::new(FfmpegLauncher::new("/nonexistent/ffmpeg")),
            settings,
            Arc::new(SystemClock),
        );
        assert!(supervisor.start().await.is_err());
        assert_eq!(supervisor.snapshot().state, ChannelState::Backoff);

        supervisor.abort().await;
        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state, ChannelState::Stopped);
        assert!(snapshot.next_attempt_at.is_none());
        assert_eq!(snapshot.restarts, 1);

        let err = supervisor.start().await.unwrap_err();
        assert_eq!(err.kind(), "supervisor_gone");

        // A second abort is harmless
        supervisor.abort().await;
        assert_eq!(supervisor.snapshot().state, ChannelState::Stopped);
    }
}
