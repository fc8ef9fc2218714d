//! Encoder process handle
//!
//! Spawns the external encoder for one channel, watches its exit status,
//! captures diagnostics from stderr, and terminates it (SIGTERM, bounded wait,
//! then SIGKILL). The handle always reaps the child before it is dropped by a
//! normal stop; on abnormal drop `kill_on_drop` takes care of it.

use parking_lot::Mutex;
use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use crate::channel::ChannelSpec;
use crate::error::{Error, Result};
use crate::segment::ChannelDir;

/// Builds the command line for a channel's encoder
pub trait EncoderLauncher: Send + Sync + 'static {
    /// Command that writes `channel`'s playlist and segments into `output`
    fn command(&self, channel: &ChannelSpec, output: &ChannelDir) -> Command;

    /// Short description of the encoding pipeline, reported by `/health`
    fn describe(&self) -> String;
}

/// Generates noise with ffmpeg's `anoisesrc` and muxes it into HLS
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    program: String,
}

impl FfmpegLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn args(&self, channel: &ChannelSpec, output: &ChannelDir) -> Vec<OsString> {
        let source = format!(
            "anoisesrc=color={}:sample_rate={}",
            channel.color, channel.sample_rate
        );

        let mut args: Vec<OsString> = [
            "-hide_banner",
            "-nostdin",
            "-loglevel",
            "warning",
            "-f",
            "lavfi",
            "-i",
        ]
        .iter()
        .map(OsString::from)
        .collect();

        args.push(source.into());
        args.extend(
            [
                "-c:a".to_string(),
                "aac".to_string(),
                "-b:a".to_string(),
                channel.audio_bitrate.clone(),
                "-f".to_string(),
                "hls".to_string(),
                "-hls_time".to_string(),
                channel.segment_time.to_string(),
                "-hls_list_size".to_string(),
                channel.list_size.to_string(),
                // Segments are renamed into place and deleted only once the
                // playlist no longer lists them
                "-hls_flags".to_string(),
                "delete_segments+temp_file".to_string(),
                "-hls_segment_filename".to_string(),
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(output.segment_template().into_os_string());
        args.push(output.playlist_path().into_os_string());
        args
    }
}

impl Default for FfmpegLauncher {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl EncoderLauncher for FfmpegLauncher {
    fn command(&self, channel: &ChannelSpec, output: &ChannelDir) -> Command {
        let mut command = Command::new(&self.program);
        command.args(self.args(channel, output));
        command
    }

    fn describe(&self) -> String {
        format!("{} anoisesrc -> aac -> hls", self.program)
    }
}

/// How an encoder ended up terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited before termination was requested
    AlreadyExited(ExitStatus),
    /// The process exited within the grace period after SIGTERM
    Graceful(ExitStatus),
    /// The process had to be killed
    Killed(Option<ExitStatus>),
}

impl Termination {
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            Termination::AlreadyExited(s) | Termination::Graceful(s) => Some(*s),
            Termination::Killed(s) => *s,
        }
    }
}

/// A running encoder bound to one channel
#[derive(Debug)]
pub struct EncoderProcess {
    channel: String,
    child: Child,
    pid: Option<u32>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl EncoderProcess {
    /// Spawn the encoder for `channel`, creating its output directory first
    pub async fn spawn(
        launcher: &dyn EncoderLauncher,
        channel: &ChannelSpec,
        output: &ChannelDir,
    ) -> Result<Self> {
        let spawn_error = |source: std::io::Error| Error::Spawn {
            channel: channel.id.clone(),
            source,
        };

        output.prepare().await.map_err(spawn_error)?;

        let mut command = launcher.command(channel, output);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group: terminal signals go to us, not straight to the encoder
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(spawn_error)?;
        let pid = child.id();

        let last_error = Arc::new(Mutex::new(None));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(channel.id.clone(), stderr, last_error.clone()));
        }

        tracing::info!(channel = %channel.id, pid = ?pid, "Encoder process spawned");

        Ok(Self {
            channel: channel.id.clone(),
            child,
            pid,
            last_error,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Last error line the encoder printed, if any
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Exit status if the process has exited, without blocking
    pub fn try_exit(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(
                    channel = %self.channel,
                    error = %e,
                    "Failed to poll encoder status"
                );
                None
            }
        }
    }

    /// Terminate and reap the process
    ///
    /// Sends SIGTERM, waits up to `grace`, then kills. Always returns once the
    /// child has been reaped (or could not be signalled at all).
    pub async fn terminate(mut self, grace: Duration) -> Termination {
        if let Some(status) = self.try_exit() {
            return Termination::AlreadyExited(status);
        }

        self.request_shutdown();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(
                    channel = %self.channel,
                    pid = ?self.pid,
                    "Encoder exited gracefully"
                );
                return Termination::Graceful(status);
            }
            Ok(Err(e)) => {
                tracing::warn!(channel = %self.channel, error = %e, "Waiting for encoder failed");
            }
            Err(_) => {
                tracing::warn!(
                    channel = %self.channel,
                    pid = ?self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "Encoder did not terminate gracefully, forcing kill"
                );
            }
        }

        if let Err(e) = self.child.kill().await {
            tracing::error!(channel = %self.channel, error = %e, "Failed to kill encoder");
        }
        Termination::Killed(self.try_exit())
    }

    #[cfg(unix)]
    fn request_shutdown(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.pid {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(channel = %self.channel, error = %e, "SIGTERM delivery failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn request_shutdown(&mut self) {
        // No graceful signal available; the grace wait then returns immediately
        let _ = self.child.start_kill();
    }
}

/// Exit code, or the negated signal number when killed by a signal
pub fn exit_code(status: &ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|sig| -sig)
    }
    #[cfg(not(unix))]
    {
        None
    }
}

async fn forward_stderr(
    channel: String,
    stderr: ChildStderr,
    last_error: Arc<Mutex<Option<String>>>,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let lower = line.to_lowercase();
                if lower.contains("error") {
                    tracing::error!(channel = %channel, "Encoder error: {}", line);
                    *last_error.lock() = Some(line.to_string());
                } else if lower.contains("warning") {
                    tracing::warn!(channel = %channel, "Encoder warning: {}", line);
                } else {
                    tracing::debug!(channel = %channel, "Encoder: {}", line);
                }
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Error reading encoder stderr");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::NoiseColor;
    use crate::config::EncoderConfig;
    use crate::segment::SegmentStore;

    fn spec() -> ChannelSpec {
        ChannelSpec::new(NoiseColor::Brown, &EncoderConfig::default())
    }

    #[test]
    fn test_ffmpeg_args_follow_channel_parameters() {
        let store = SegmentStore::new("/srv/hls");
        let dir = store.channel("noise_brown");
        let args: Vec<String> = FfmpegLauncher::default()
            .args(&spec(), &dir)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let after = |flag: &str| {
            let i = args.iter().position(|a| a == flag).unwrap();
            args[i + 1].clone()
        };

        assert_eq!(after("-i"), "anoisesrc=color=brown:sample_rate=44100");
        assert_eq!(after("-b:a"), "128k");
        assert_eq!(after("-hls_time"), "2");
        assert_eq!(after("-hls_list_size"), "5");
        assert_eq!(after("-hls_flags"), "delete_segments+temp_file");
        assert_eq!(after("-hls_segment_filename"), "/srv/hls/noise_brown/segment%03d.ts");
        assert_eq!(args.last().unwrap(), "/srv/hls/noise_brown/stream.m3u8");
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = SegmentStore::new(tmp.path()).channel("noise_brown");
        let launcher = FfmpegLauncher::new("/nonexistent/path/to/ffmpeg");

        match EncoderProcess::spawn(&launcher, &spec(), &dir).await {
            Err(Error::Spawn { channel, .. }) => assert_eq!(channel, "noise_brown"),
            other => panic!("expected spawn error, got {:?}", other),
        }
        // The output directory is still prepared for the next attempt
        assert!(dir.path().is_dir());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        struct Shell(&'static str);

        impl EncoderLauncher for Shell {
            fn command(&self, _channel: &ChannelSpec, output: &ChannelDir) -> Command {
                let mut command = Command::new("sh");
                command.arg("-c").arg(self.0).current_dir(output.path());
                command
            }

            fn describe(&self) -> String {
                "sh".to_string()
            }
        }

        #[tokio::test]
        async fn test_terminate_reaps_running_process() {
            let tmp = tempfile::tempdir().unwrap();
            let dir = SegmentStore::new(tmp.path()).channel("noise_brown");
            let mut process = EncoderProcess::spawn(&Shell("sleep 30"), &spec(), &dir)
                .await
                .unwrap();

            assert!(process.pid().is_some());
            assert!(process.try_exit().is_none());

            let outcome = process.terminate(Duration::from_secs(2)).await;
            assert!(matches!(outcome, Termination::Graceful(_)), "{outcome:?}");
        }

        #[tokio::test]
        async fn test_terminate_kills_after_grace() {
            let tmp = tempfile::tempdir().unwrap();
            let dir = SegmentStore::new(tmp.path()).channel("noise_brown");
            let process = EncoderProcess::spawn(
                &Shell("trap '' TERM; while true; do sleep 0.05; done"),
                &spec(),
                &dir,
            )
            .await
            .unwrap();

            // Let the shell install its trap
            tokio::time::sleep(Duration::from_millis(100)).await;
            let outcome = process.terminate(Duration::from_millis(200)).await;
            assert!(matches!(outcome, Termination::Killed(_)), "{outcome:?}");
        }

        #[tokio::test]
        async fn test_exit_status_and_stderr_capture() {
            let tmp = tempfile::tempdir().unwrap();
            let dir = SegmentStore::new(tmp.path()).channel("noise_brown");
            let mut process = EncoderProcess::spawn(
                &Shell("echo 'Error opening output file' >&2; exit 3"),
                &spec(),
                &dir,
            )
            .await
            .unwrap();

            let mut status = None;
            for _ in 0..100 {
                status = process.try_exit();
                if status.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let status = status.expect("process should exit");
            assert_eq!(exit_code(&status), Some(3));

            // stderr is drained concurrently; give the reader a moment
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(
                process.last_error().as_deref(),
                Some("Error opening output file")
            );

            let outcome = process.terminate(Duration::from_millis(100)).await;
            assert!(matches!(outcome, Termination::AlreadyExited(_)));
        }
    }
}
