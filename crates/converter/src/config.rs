use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Time the wrapper timeout reserves for staging the source and delivering the reel
pub const STAGING_MARGIN_SECS: u64 = 1;

/// Which canvas axis the cropped clip is scaled to fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillAxis {
    Height,
    Width,
}

/// How the source frame is fitted onto the canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutStrategy {
    /// Crop the centered square, scale it along the fill axis, compose on the canvas
    CropFill,
    /// Keep the whole frame, scale it to fit inside the canvas, pad the rest
    PadFit,
}

/// Configuration for the reel converter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Longest clip accepted at admission, in seconds
    pub max_duration_seconds: f64,
    /// Largest source file accepted at admission
    pub max_input_size_bytes: u64,
    /// Largest output artifact handed to delivery
    pub max_output_size_bytes: u64,
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// Maximum number of encoder processes running at once
    pub worker_pool_size: usize,
    pub cpu_degrade_threshold_percent: f32,
    pub mem_degrade_threshold_percent: f32,
    /// Number of free conversions a new account gets
    pub free_trial_count: u32,
    /// Premium units credited per purchased pack
    pub premium_unit_grant_size: u32,

    /// Ledger JSON file holding every account
    pub ledger_path: PathBuf,
    /// Per-job workspaces are created under this directory
    pub temp_dir: PathBuf,
    /// Finished reels are delivered here, one subdirectory per account
    pub output_dir: PathBuf,
    /// Daemon ingest root, one subdirectory per account
    pub inbox_dir: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,

    /// Encoder thread count passed to every profile
    pub encode_threads: u32,
    pub output_fps: u32,
    /// Upscaling beyond this factor is clamped
    pub max_scale_factor: f64,
    pub fill_axis: FillAxis,
    pub layout: LayoutStrategy,
    /// Canvas color in ffmpeg color syntax
    pub background_color: String,

    /// CPU sampling window for the resource monitor, in milliseconds
    pub sample_interval_ms: u64,
    pub probe_timeout_secs: u64,
    /// Per-attempt encoder subprocess timeout
    pub encode_timeout_secs: u64,
    /// Wrapper timeout around a whole job
    pub job_timeout_secs: u64,
    /// Interval in seconds between inbox scans
    pub scan_interval_secs: u64,
    /// Delay between the two size reads of the stable-file check
    pub stable_check_secs: u64,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ConverterConfig {
    /// Create a default configuration sized for a small single-host deployment
    pub fn default_config() -> Self {
        Self {
            max_duration_seconds: 60.0,
            max_input_size_bytes: 50 * 1024 * 1024, // 50MB
            max_output_size_bytes: 50 * 1024 * 1024,
            canvas_width: 1080,
            canvas_height: 1920,
            worker_pool_size: 2,
            cpu_degrade_threshold_percent: 80.0,
            mem_degrade_threshold_percent: 85.0,
            free_trial_count: 1,
            premium_unit_grant_size: 10,
            ledger_path: PathBuf::from("/var/lib/reelsd/ledger.json"),
            temp_dir: PathBuf::from("/tmp/reelsd"),
            output_dir: PathBuf::from("/var/lib/reelsd/outbox"),
            inbox_dir: PathBuf::from("/var/lib/reelsd/inbox"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            encode_threads: 2,
            output_fps: 30,
            max_scale_factor: 3.0,
            fill_axis: FillAxis::Height,
            layout: LayoutStrategy::CropFill,
            background_color: "black".to_string(),
            sample_interval_ms: 200,
            probe_timeout_secs: 30,
            encode_timeout_secs: 240,
            job_timeout_secs: 600,
            scan_interval_secs: 5,
            stable_check_secs: 2,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Directory where `reelsd grant` queues work for a running daemon
    pub fn command_dir(&self) -> PathBuf {
        self.ledger_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("commands")
    }

    /// Longest a job can spend in subprocesses: source and output probes plus a
    /// primary and a fallback encode, each at its own timeout
    pub fn worst_case_chain_secs(&self) -> u64 {
        self.encode_timeout_secs
            .saturating_add(self.probe_timeout_secs)
            .saturating_mul(2)
    }

    /// Reject configurations the controller cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            bail!("worker_pool_size must be at least 1");
        }
        if self.canvas_width == 0 || self.canvas_height == 0 {
            bail!("canvas must be non-empty, got {}x{}", self.canvas_width, self.canvas_height);
        }
        if self.canvas_width % 2 != 0 || self.canvas_height % 2 != 0 {
            bail!(
                "canvas dimensions must be even for yuv420p output, got {}x{}",
                self.canvas_width,
                self.canvas_height
            );
        }
        if !(self.max_scale_factor >= 1.0) {
            bail!("max_scale_factor must be >= 1.0, got {}", self.max_scale_factor);
        }
        if self.encode_timeout_secs == 0 || self.probe_timeout_secs == 0 {
            bail!("encode_timeout_secs and probe_timeout_secs must be non-zero");
        }
        let chain = self.worst_case_chain_secs();
        if chain.saturating_add(STAGING_MARGIN_SECS) > self.job_timeout_secs {
            bail!(
                "job_timeout_secs ({}) must leave {}s over the worst-case encode chain of {}s \
                 (2 x encode_timeout_secs {} + 2 x probe_timeout_secs {})",
                self.job_timeout_secs,
                STAGING_MARGIN_SECS,
                chain,
                self.encode_timeout_secs,
                self.probe_timeout_secs
            );
        }
        if self.output_fps == 0 {
            bail!("output_fps must be non-zero");
        }
        Ok(())
    }
}
