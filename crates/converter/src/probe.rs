use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use log::debug;
use serde::Deserialize;
use tokio::process::Command;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
    pub size: Option<String>,
    pub bit_rate: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration: Option<String>,
    pub avg_frame_rate: Option<String>,
}

/// Audio codecs the MP4 muxer accepts without re-encoding
const MP4_AUDIO_CODECS: &[&str] = &["aac", "mp3", "alac", "ac3", "eac3"];

impl FFProbeData {
    pub fn video_stream(&self) -> Option<&FFProbeStream> {
        self.streams.iter().find(|s| s.codec_type.as_deref() == Some("video"))
    }

    pub fn audio_stream(&self) -> Option<&FFProbeStream> {
        self.streams.iter().find(|s| s.codec_type.as_deref() == Some("audio"))
    }

    pub fn has_audio(&self) -> bool {
        self.audio_stream().is_some()
    }

    /// Native frame size of the first video stream
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let video = self.video_stream()?;
        match (video.width, video.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w as u32, h as u32)),
            _ => None,
        }
    }

    /// Container duration, falling back to the video stream's
    pub fn duration_secs(&self) -> Option<f64> {
        let parse = |s: &Option<String>| s.as_deref().and_then(|d| d.parse::<f64>().ok()).filter(|d| d.is_finite() && *d >= 0.0);
        parse(&self.format.duration).or_else(|| self.video_stream().and_then(|v| parse(&v.duration)))
    }

    /// Whether the audio track can be stream-copied into an MP4
    pub fn audio_copyable(&self) -> bool {
        self.audio_stream()
            .and_then(|a| a.codec_name.as_deref())
            .map(|codec| MP4_AUDIO_CODECS.contains(&codec))
            .unwrap_or(false)
    }
}

/// Run ffprobe on a file and parse the JSON output
pub async fn probe_file(ffprobe_bin: &Path, file_path: &Path, timeout_secs: u64) -> Result<FFProbeData> {
    if !file_path.exists() {
        anyhow::bail!("File does not exist: {}", file_path.display());
    }

    debug!("ffprobe: probing {}", file_path.display());

    let mut cmd = Command::new(ffprobe_bin);
    cmd.arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format")
        .arg(file_path)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output())
        .await
        .map_err(|_| anyhow!("ffprobe timed out after {}s for {}", timeout_secs, file_path.display()))?
        .with_context(|| format!("Failed to execute ffprobe at {} for: {}", ffprobe_bin.display(), file_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        anyhow::bail!(
            "ffprobe failed (exit code {}) for {}:\nSTDERR: {}",
            exit_code,
            file_path.display(),
            stderr
        );
    }

    parse_probe_json(&output.stdout)
        .with_context(|| format!("Failed to parse ffprobe JSON for: {}", file_path.display()))
}

pub fn parse_probe_json(bytes: &[u8]) -> Result<FFProbeData> {
    let data: FFProbeData = serde_json::from_slice(bytes)?;
    Ok(data)
}
