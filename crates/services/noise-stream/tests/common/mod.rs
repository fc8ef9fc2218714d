//! Shared fixtures for integration tests
//!
//! A tiny shell script stands in for ffmpeg: it writes a segment and an
//! atomically renamed playlist every 100ms until it is killed.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use noise_stream::channel::{ChannelSnapshot, ChannelSpec};
use noise_stream::config::Config;
use noise_stream::encoder::EncoderLauncher;
use noise_stream::segment::ChannelDir;
use tokio::process::Command;
use tokio::sync::watch;

const FAKE_ENCODER: &str = r#"
i=0
while true; do
  seg=$(printf 'segment%03d.ts' "$i")
  printf 'noise' > "$seg"
  printf '#EXTM3U\n#EXT-X-TARGETDURATION:1\n#EXTINF:1.000000,\n%s\n' "$seg" \
    > stream.m3u8.tmp
  mv stream.m3u8.tmp stream.m3u8
  if [ "$i" -ge 5 ]; then
    rm -f "$(printf 'segment%03d.ts' $((i - 5)))"
  fi
  i=$((i + 1))
  sleep 0.1
done
"#;

/// Runs the fake encoder, optionally failing some launches
pub struct ScriptLauncher {
    broken_channel: Option<String>,
    failures_left: AtomicUsize,
    ignore_term: bool,
}

impl ScriptLauncher {
    pub fn new() -> Self {
        Self {
            broken_channel: None,
            failures_left: AtomicUsize::new(0),
            ignore_term: false,
        }
    }

    /// Launches for `channel` point at a binary that does not exist
    pub fn failing_for(channel: &str) -> Self {
        Self {
            broken_channel: Some(channel.to_string()),
            ..Self::new()
        }
    }

    /// The first `count` launches fail, later ones succeed
    pub fn failing_first(count: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(count),
            ..Self::new()
        }
    }

    /// The encoder ignores SIGTERM and only goes away when killed
    pub fn ignoring_term() -> Self {
        Self {
            ignore_term: true,
            ..Self::new()
        }
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl EncoderLauncher for ScriptLauncher {
    fn command(&self, channel: &ChannelSpec, output: &ChannelDir) -> Command {
        let broken = self.broken_channel.as_deref() == Some(channel.id.as_str());
        let mut command = if broken || self.take_failure() {
            Command::new("/nonexistent/encoder")
        } else {
            let script = if self.ignore_term {
                format!("trap '' TERM\n{}", FAKE_ENCODER)
            } else {
                FAKE_ENCODER.to_string()
            };
            let mut command = Command::new("sh");
            command.arg("-c").arg(script);
            command
        };
        command.current_dir(output.path());
        command
    }

    fn describe(&self) -> String {
        "sh fake encoder".to_string()
    }
}

/// Config with short intervals so lifecycle transitions happen in milliseconds
pub fn fast_config(hls_dir: &Path) -> Config {
    let mut config = Config::default();
    config.channels.hls_dir = hls_dir.to_path_buf();
    config.encoder.segment_time = 1;
    config.supervisor.check_interval_ms = 50;
    config.supervisor.staleness_multiplier = 3.0;
    config.supervisor.base_backoff_ms = 100;
    config.supervisor.max_backoff_ms = 400;
    config.supervisor.stop_grace_ms = 500;
    config.supervisor.shutdown_timeout_ms = 2000;
    config
}

/// Wait until a published snapshot satisfies `predicate`
pub async fn wait_for<F>(
    rx: &mut watch::Receiver<ChannelSnapshot>,
    predicate: F,
) -> ChannelSnapshot
where
    F: FnMut(&ChannelSnapshot) -> bool,
{
    let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for channel state")
        .expect("supervisor went away");
    snapshot.clone()
}
