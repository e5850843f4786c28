//! Scripted stand-in for ffmpeg/ffprobe used by the async tests

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::{bail, Result};
use tokio::sync::Semaphore;
use crate::error::AttemptError;
use crate::ffmpeg::{FFmpegResult, MediaTools};
use crate::probe::{parse_probe_json, FFProbeData};

/// What the next encoder run does
#[derive(Debug, Clone)]
pub enum Step {
    /// Exit 0 after writing this many bytes to the output path
    Succeed(usize),
    /// Exit 0 without writing anything
    NoOutput,
    Exit(i32),
    /// Subprocess-level timeout
    TimedOut,
    SpawnFails,
    /// Never finishes; only the job wrapper can stop it
    Stall,
}

pub struct ScriptedTools {
    pub source_size: (u32, u32),
    pub source_duration: f64,
    pub audio_codec: Option<&'static str>,
    pub unreadable_source: bool,
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<Vec<String>>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedTools {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            source_size: (384, 384),
            source_duration: 12.0,
            audio_codec: Some("aac"),
            unreadable_source: false,
            steps: Mutex::new(steps.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Every encode waits for a permit on `gate` before doing anything
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    fn probe_json(width: u32, height: u32, duration: f64, audio: Option<&str>) -> String {
        let audio = audio
            .map(|c| format!(r#",{{"index": 1, "codec_type": "audio", "codec_name": "{}"}}"#, c))
            .unwrap_or_default();
        format!(
            r#"{{"streams": [{{"index": 0, "codec_type": "video", "codec_name": "h264", "width": {}, "height": {}}}{}],
                "format": {{"duration": "{}"}}}}"#,
            width, height, audio, duration
        )
    }
}

impl MediaTools for ScriptedTools {
    async fn probe(&self, path: &Path) -> Result<FFProbeData> {
        let is_output = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("reel"))
            .unwrap_or(false);
        let json = if is_output {
            Self::probe_json(1080, 1920, self.source_duration, Some("aac"))
        } else {
            if self.unreadable_source {
                bail!("Invalid data found when processing input");
            }
            let (w, h) = self.source_size;
            Self::probe_json(w, h, self.source_duration, self.audio_codec)
        };
        parse_probe_json(json.as_bytes())
    }

    async fn encode(&self, args: Vec<String>, timeout: Duration) -> Result<FFmpegResult, AttemptError> {
        self.calls.lock().unwrap().push(args.clone());
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Succeed(4096));
        let output = args.last().cloned().unwrap_or_default();
        let ok = FFmpegResult { exit_code: Some(0), stderr: String::new() };
        match step {
            Step::Succeed(bytes) => {
                tokio::fs::write(&output, vec![0u8; bytes]).await.unwrap();
                Ok(ok)
            }
            Step::NoOutput => Ok(ok),
            Step::Exit(code) => Err(AttemptError::NonZeroExit {
                code: Some(code),
                stderr_tail: "Error reinitializing filters!".to_string(),
            }),
            Step::TimedOut => Err(AttemptError::TimedOut { secs: timeout.as_secs() }),
            Step::SpawnFails => Err(AttemptError::Spawn("ffmpeg: No such file or directory".to_string())),
            Step::Stall => std::future::pending().await,
        }
    }
}
