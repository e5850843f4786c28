use std::fmt;
use log::info;
use serde::Serialize;
use crate::config::{ConverterConfig, FillAxis};
use crate::job::Job;
use crate::resource::ResourceSnapshot;

/// Balanced video bitrate, matching the 5M target of the reference encodes
const BALANCED_VIDEO_KBPS: u32 = 5_000;
/// Floor for the size-aware bitrate cap
const MIN_VIDEO_KBPS: u32 = 500;
const BALANCED_AUDIO_KBPS: u32 = 192;
const DEGRADED_AUDIO_KBPS: u32 = 128;
const DEGRADED_CRF: u8 = 30;
/// Fraction of the output size limit the expected stream size may use
const OUTPUT_BUDGET_RATIO: f64 = 0.9;

/// Degradation tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QualityTier {
    Balanced,
    Degraded,
}

/// Video rate control of a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RateControl {
    /// Constant rate factor, higher = smaller and lower quality
    Crf(u8),
    /// Average bitrate in kbit/s
    BitrateKbps(u32),
}

impl fmt::Display for RateControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateControl::Crf(crf) => write!(f, "crf {}", crf),
            RateControl::BitrateKbps(kbps) => write!(f, "{}k", kbps),
        }
    }
}

/// Encoder parameters chosen for one job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodeProfile {
    pub tier: QualityTier,
    /// libx264 preset name
    pub preset: String,
    pub rate: RateControl,
    pub audio_kbps: u32,
    pub thread_count: u32,
    pub fps: u32,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub fill_axis: FillAxis,
}

/// Maps host load and job size to an encode profile
pub struct QualitySelector {
    cpu_threshold: f32,
    mem_threshold: f32,
    threads: u32,
    fps: u32,
    canvas: (u32, u32),
    fill_axis: FillAxis,
    max_output_bytes: u64,
}

impl QualitySelector {
    pub fn new(cfg: &ConverterConfig) -> Self {
        Self {
            cpu_threshold: cfg.cpu_degrade_threshold_percent,
            mem_threshold: cfg.mem_degrade_threshold_percent,
            threads: cfg.encode_threads.max(1),
            fps: cfg.output_fps,
            canvas: (cfg.canvas_width, cfg.canvas_height),
            fill_axis: cfg.fill_axis,
            max_output_bytes: cfg.max_output_size_bytes,
        }
    }

    pub fn tier_for(&self, snapshot: &ResourceSnapshot) -> QualityTier {
        if snapshot.cpu_percent < self.cpu_threshold && snapshot.mem_percent < self.mem_threshold {
            QualityTier::Balanced
        } else {
            QualityTier::Degraded
        }
    }

    /// Choose the profile for a job under the given host load
    pub fn select(&self, snapshot: &ResourceSnapshot, job: &Job) -> EncodeProfile {
        let tier = self.tier_for(snapshot);
        let (preset, rate, audio_kbps) = match tier {
            QualityTier::Balanced => (
                "medium",
                RateControl::BitrateKbps(self.bitrate_cap(job.declared_duration_secs, BALANCED_AUDIO_KBPS)),
                BALANCED_AUDIO_KBPS,
            ),
            QualityTier::Degraded => ("ultrafast", RateControl::Crf(DEGRADED_CRF), DEGRADED_AUDIO_KBPS),
        };

        let profile = EncodeProfile {
            tier,
            preset: preset.to_string(),
            rate,
            audio_kbps,
            thread_count: self.threads,
            fps: self.fps,
            canvas_width: self.canvas.0,
            canvas_height: self.canvas.1,
            fill_axis: self.fill_axis,
        };

        info!(
            "Job {}: {:?} profile (cpu {:.1}%, mem {:.1}%): preset {}, {}, {} threads, {}x{}",
            job.id, tier, snapshot.cpu_percent, snapshot.mem_percent,
            profile.preset, profile.rate, profile.thread_count, profile.canvas_width, profile.canvas_height
        );

        profile
    }

    /// Video bitrate that keeps the expected output under the size limit
    fn bitrate_cap(&self, duration_secs: f64, audio_kbps: u32) -> u32 {
        if !(duration_secs > 0.0) {
            return BALANCED_VIDEO_KBPS;
        }
        let budget_kbits = self.max_output_bytes as f64 * 8.0 / 1000.0 * OUTPUT_BUDGET_RATIO;
        let total_kbps = budget_kbits / duration_secs;
        let video_kbps = (total_kbps - audio_kbps as f64).floor();
        if video_kbps >= BALANCED_VIDEO_KBPS as f64 {
            BALANCED_VIDEO_KBPS
        } else {
            (video_kbps.max(MIN_VIDEO_KBPS as f64)) as u32
        }
    }
}
