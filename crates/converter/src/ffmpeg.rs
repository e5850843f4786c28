use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use crate::config::ConverterConfig;
use crate::error::AttemptError;
use crate::geometry::{self, Layout};
use crate::probe::{self, FFProbeData};
use crate::quality::{EncodeProfile, RateControl};

/// Lines of encoder stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;
/// Audio bitrate when the fallback cannot stream-copy
const FALLBACK_AUDIO_KBPS: u32 = 128;

/// External media tools used by the pipeline
pub trait MediaTools: Send + Sync + 'static {
    /// Inspect a media file
    fn probe(&self, path: &Path) -> impl Future<Output = Result<FFProbeData>> + Send;

    /// Run the encoder with the given arguments, bounded by `timeout`
    fn encode(&self, args: Vec<String>, timeout: Duration) -> impl Future<Output = Result<FFmpegResult, AttemptError>> + Send;
}

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FFmpegVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FFmpegVersion {
    /// Parse version from FFmpeg version string
    /// Example: "ffmpeg version 6.1.1-3ubuntu5" -> FFmpegVersion { major: 6, minor: 1, patch: 1 }
    pub fn parse(version_str: &str) -> Result<Self> {
        let version_part = version_str
            .split_whitespace()
            .map(|s| s.trim_start_matches('n'))
            .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            .ok_or_else(|| anyhow!("No version number found in: {}", version_str))?;

        let leading_number = |part: &str| -> Option<u32> {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        };

        let mut parts = version_part.split('.');
        let major = parts
            .next()
            .and_then(leading_number)
            .ok_or_else(|| anyhow!("Invalid version format: {}", version_str))?;
        let minor = parts.next().and_then(leading_number).unwrap_or(0);
        let patch = parts.next().and_then(leading_number).unwrap_or(0);

        Ok(FFmpegVersion { major, minor, patch })
    }
}

/// Result from FFmpeg execution
#[derive(Debug, Clone)]
pub struct FFmpegResult {
    pub exit_code: Option<i32>,
    pub stderr: String,
}

/// Manager for the FFmpeg binaries
pub struct FFmpegManager {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    probe_timeout_secs: u64,
}

impl FFmpegManager {
    pub fn new(config: &ConverterConfig) -> Self {
        Self {
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            ffprobe_bin: config.ffprobe_bin.clone(),
            probe_timeout_secs: config.probe_timeout_secs,
        }
    }

    /// Check that ffmpeg runs and ships the encoders the pipeline uses
    pub async fn check_available(&self) -> Result<FFmpegVersion> {
        let output = Command::new(&self.ffmpeg_bin)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to execute FFmpeg at: {}", self.ffmpeg_bin.display()))?;

        if !output.status.success() {
            return Err(anyhow!("FFmpeg version check failed"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().next().ok_or_else(|| anyhow!("Empty output from FFmpeg -version"))?;
        let version = FFmpegVersion::parse(first_line)?;

        let encoders = Command::new(&self.ffmpeg_bin)
            .arg("-hide_banner")
            .arg("-encoders")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to query FFmpeg encoders at: {}", self.ffmpeg_bin.display()))?;
        let listing = String::from_utf8_lossy(&encoders.stdout);
        if !listing.contains("libx264") {
            return Err(anyhow!("FFmpeg at {} was built without libx264", self.ffmpeg_bin.display()));
        }

        info!("✅ FFmpeg {}.{}.{} found with libx264", version.major, version.minor, version.patch);
        Ok(version)
    }

    /// Execute FFmpeg with a timeout; the process is killed when the timeout fires
    /// or when the returned future is dropped.
    pub async fn execute_ffmpeg(&self, args: Vec<String>, timeout: Duration) -> Result<FFmpegResult, AttemptError> {
        let cmd_str = format!("{} {}", self.ffmpeg_bin.display(), args.join(" "));
        debug!("Executing FFmpeg: {}", cmd_str);

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| AttemptError::Spawn(format!("{}: {}", self.ffmpeg_bin.display(), e)))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AttemptError::Spawn("failed to capture FFmpeg stderr".to_string()))?;

        let stderr_handle = tokio::spawn(async move {
            let mut tail = std::collections::VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(result) => result.map_err(|e| AttemptError::Spawn(format!("failed to wait for FFmpeg: {}", e)))?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    log::warn!("Failed to kill stuck FFmpeg process: {}", e);
                }
                stderr_handle.abort();
                return Err(AttemptError::TimedOut { secs: timeout.as_secs() });
            }
        };

        let stderr = stderr_handle.await.unwrap_or_default();
        let exit_code = status.code();

        if !status.success() {
            return Err(AttemptError::NonZeroExit { code: exit_code, stderr_tail: stderr });
        }

        debug!("FFmpeg execution completed successfully");
        Ok(FFmpegResult { exit_code, stderr })
    }
}

impl MediaTools for FFmpegManager {
    async fn probe(&self, path: &Path) -> Result<FFProbeData> {
        probe::probe_file(&self.ffprobe_bin, path, self.probe_timeout_secs).await
    }

    async fn encode(&self, args: Vec<String>, timeout: Duration) -> Result<FFmpegResult, AttemptError> {
        self.execute_ffmpeg(args, timeout).await
    }
}

/// Command builder for generating FFmpeg command lines
pub struct CommandBuilder {
    background: String,
}

impl CommandBuilder {
    pub fn new(background: impl Into<String>) -> Self {
        CommandBuilder { background: background.into() }
    }

    /// Full transform-and-encode command for the chosen profile
    pub fn build_primary_command(
        &self,
        input: &Path,
        output: &Path,
        layout: &Layout,
        profile: &EncodeProfile,
        has_audio: bool,
    ) -> Vec<String> {
        let mut args = vec!["-hide_banner".to_string(), "-nostdin".to_string(), "-y".to_string()];

        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());

        args.push("-filter_complex".to_string());
        args.push(layout.filter_complex(&self.background, profile.fps));
        args.push("-map".to_string());
        args.push("[v]".to_string());
        if has_audio {
            args.push("-map".to_string());
            args.push("0:a:0".to_string());
        }

        args.push("-c:v".to_string());
        args.push("libx264".to_string());
        args.push("-preset".to_string());
        args.push(profile.preset.clone());

        match profile.rate {
            RateControl::Crf(crf) => {
                args.push("-crf".to_string());
                args.push(crf.to_string());
            }
            RateControl::BitrateKbps(kbps) => {
                args.push("-b:v".to_string());
                args.push(format!("{}k", kbps));
                args.push("-maxrate".to_string());
                args.push(format!("{}k", kbps));
                args.push("-bufsize".to_string());
                args.push(format!("{}k", kbps * 2));
            }
        }

        args.push("-threads".to_string());
        args.push(profile.thread_count.to_string());
        args.push("-r".to_string());
        args.push(profile.fps.to_string());
        args.push("-pix_fmt".to_string());
        args.push("yuv420p".to_string());

        if has_audio {
            args.push("-c:a".to_string());
            args.push("aac".to_string());
            args.push("-b:a".to_string());
            args.push(format!("{}k", profile.audio_kbps));
        } else {
            args.push("-an".to_string());
        }

        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
        args.push(output.to_string_lossy().to_string());

        args
    }

    /// Minimal, maximally compatible command: fastest preset, plain scale+pad,
    /// audio copied when the container allows it, no rate control tuning
    pub fn build_fallback_command(
        &self,
        input: &Path,
        output: &Path,
        canvas: (u32, u32),
        meta: &FFProbeData,
    ) -> Vec<String> {
        let mut args = vec!["-hide_banner".to_string(), "-nostdin".to_string(), "-y".to_string()];

        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());
        args.push("-map".to_string());
        args.push("0:v:0".to_string());

        args.push("-vf".to_string());
        args.push(geometry::pad_fit_filter(canvas, &self.background));
        args.push("-c:v".to_string());
        args.push("libx264".to_string());
        args.push("-preset".to_string());
        args.push("ultrafast".to_string());

        if meta.has_audio() {
            args.push("-map".to_string());
            args.push("0:a:0".to_string());
            args.push("-c:a".to_string());
            if meta.audio_copyable() {
                args.push("copy".to_string());
            } else {
                args.push("aac".to_string());
                args.push("-b:a".to_string());
                args.push(format!("{}k", FALLBACK_AUDIO_KBPS));
            }
        } else {
            args.push("-an".to_string());
        }

        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
        args.push(output.to_string_lossy().to_string());

        args
    }
}
