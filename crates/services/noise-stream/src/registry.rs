//! Stream registry
//!
//! The fixed set of configured channels, one supervisor each, created at
//! startup in configured order and dropped only at shutdown. Bulk operations
//! fan out to every supervisor concurrently and collect one outcome per
//! channel; a failing channel never short-circuits the others.

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::NoiseColor;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::encoder::EncoderLauncher;
use crate::error::{Error, Result};
use crate::health::{ChannelHealth, HealthPolicy, RegistryHealth};
use crate::segment::SegmentStore;
use crate::supervisor::{
    ChannelStatus, ChannelSupervisor, StartOutcome, StopOutcome, SupervisorSettings,
};

/// Per-channel result of a start request
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub stream_id: String,
    pub noise: NoiseColor,
    /// The channel is (now) running or starting
    pub started: bool,
    /// `started`, `already_running` or `failed`
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StartReport {
    pub fn new(channel: &ChannelSupervisor, result: &Result<StartOutcome>) -> Self {
        let spec = channel.spec();
        let (started, status, error) = match result {
            Ok(StartOutcome::Started) => (true, "started", None),
            Ok(StartOutcome::AlreadyRunning) => (true, "already_running", None),
            Err(e) => (false, "failed", Some(e.to_string())),
        };

        Self {
            stream_id: spec.id.clone(),
            noise: spec.color,
            started,
            status,
            stream_url: started.then(|| spec.stream_url()),
            error,
        }
    }
}

/// Per-channel result of a stop request
#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub stream_id: String,
    pub stopped: bool,
    /// `stopped`, `was_not_running` or `failed`
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StopReport {
    pub fn new(channel: &ChannelSupervisor, result: &Result<StopOutcome>) -> Self {
        let (stopped, status, error) = match result {
            Ok(StopOutcome::Stopped) => (true, "stopped", None),
            Ok(StopOutcome::WasNotRunning) => (false, "was_not_running", None),
            Err(e) => (false, "failed", Some(e.to_string())),
        };

        Self {
            stream_id: channel.id().to_string(),
            stopped,
            status,
            error,
        }
    }
}

/// All configured channels
pub struct StreamRegistry {
    store: SegmentStore,
    channels: Vec<ChannelSupervisor>,
    health_policy: HealthPolicy,
    pipeline: String,
}

impl StreamRegistry {
    /// Create one supervisor per configured channel, all STOPPED
    pub async fn from_config(config: &Config, launcher: Arc<dyn EncoderLauncher>) -> Result<Self> {
        Self::with_clock(config, launcher, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(
        config: &Config,
        launcher: Arc<dyn EncoderLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let specs = config.channel_specs()?;
        let store = SegmentStore::new(&config.channels.hls_dir);
        store.ensure_root().await?;

        let pipeline = launcher.describe();
        let channels = specs
            .into_iter()
            .map(|spec| {
                let settings = SupervisorSettings::for_channel(&spec, &config.supervisor);
                let dir = store.channel(&spec.id);
                ChannelSupervisor::spawn(spec, dir, launcher.clone(), settings, clock.clone())
            })
            .collect::<Vec<_>>();

        tracing::info!(
            channels = channels.len(),
            hls_dir = %store.root().display(),
            "Stream registry created"
        );

        Ok(Self {
            store,
            channels,
            health_policy: HealthPolicy {
                min_running_fraction: config.supervisor.min_running_fraction,
                crash_loop_threshold: config.supervisor.crash_loop_threshold,
            },
            pipeline,
        })
    }

    pub fn get(&self, id: &str) -> Result<&ChannelSupervisor> {
        self.channels
            .iter()
            .find(|c| c.id() == id)
            .ok_or_else(|| Error::NotFound(format!("Stream {}", id)))
    }

    /// Channels in configured order
    pub fn channels(&self) -> &[ChannelSupervisor] {
        &self.channels
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub async fn start_all(&self) -> Vec<StartReport> {
        let starts = self.channels.iter().map(|channel| async move {
            let result = channel.start().await;
            StartReport::new(channel, &result)
        });
        join_all(starts).await
    }

    pub async fn stop_all(&self) -> Vec<StopReport> {
        let stops = self.channels.iter().map(|channel| async move {
            let result = channel.stop().await;
            StopReport::new(channel, &result)
        });
        join_all(stops).await
    }

    pub async fn status(&self) -> BTreeMap<String, ChannelStatus> {
        join_all(self.channels.iter().map(|c| c.status()))
            .await
            .into_iter()
            .map(|status| (status.stream_id.clone(), status))
            .collect()
    }

    pub async fn channel_health(&self, id: &str) -> Result<ChannelHealth> {
        let channel = self.get(id)?;
        Ok(self.evaluate(channel).await)
    }

    pub async fn health(&self) -> RegistryHealth {
        let channels = join_all(self.channels.iter().map(|c| self.evaluate(c))).await;
        RegistryHealth::aggregate(channels, &self.health_policy)
    }

    /// Stop every channel concurrently within `timeout`
    ///
    /// Channels still running when the timeout expires have their supervisor
    /// aborted, which kills the encoder along with it.
    pub async fn shutdown(&self, timeout: Duration) {
        tracing::info!(
            channels = self.channels.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Shutting down all channels"
        );

        let stops = self.channels.iter().map(|channel| async move {
            match tokio::time::timeout(timeout, channel.stop()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        channel = %channel.id(),
                        error = %e,
                        "Stop failed during shutdown"
                    );
                }
                Err(_) => {
                    let err = Error::ShutdownTimeout {
                        channel: channel.id().to_string(),
                        timeout,
                    };
                    tracing::error!(channel = %channel.id(), error = %err, "Forcing channel down");
                    channel.abort().await;
                }
            }
        });
        join_all(stops).await;
    }

    async fn evaluate(&self, channel: &ChannelSupervisor) -> ChannelHealth {
        let status = channel.status().await;
        ChannelHealth::evaluate(&status, channel.settings().stale_after, &self.health_policy)
    }
}
