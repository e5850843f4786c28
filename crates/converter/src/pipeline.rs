use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};
use crate::config::{ConverterConfig, LayoutStrategy};
use crate::error::{AttemptError, EncodeStage, JobFailure};
use crate::ffmpeg::{CommandBuilder, MediaTools};
use crate::geometry::{self, Layout};
use crate::job::OutputArtifact;
use crate::probe::FFProbeData;
use crate::quality::EncodeProfile;

/// Which command an attempt runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Primary,
    Fallback,
}

/// Probed facts about a staged source
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub meta: FFProbeData,
    pub width: u32,
    pub height: u32,
}

/// Geometric transform plus encoder invocation
pub struct TransformPipeline<T: MediaTools> {
    tools: Arc<T>,
    builder: CommandBuilder,
    layout: LayoutStrategy,
    max_scale_factor: f64,
    encode_timeout: Duration,
    max_output_bytes: u64,
}

impl<T: MediaTools> TransformPipeline<T> {
    pub fn new(tools: Arc<T>, cfg: &ConverterConfig) -> Self {
        Self {
            tools,
            builder: CommandBuilder::new(cfg.background_color.clone()),
            layout: cfg.layout,
            max_scale_factor: cfg.max_scale_factor,
            encode_timeout: Duration::from_secs(cfg.encode_timeout_secs),
            max_output_bytes: cfg.max_output_size_bytes,
        }
    }

    /// Determine the source's native frame dimensions
    pub async fn inspect(&self, source: &Path) -> Result<SourceInfo, JobFailure> {
        let meta = self.tools.probe(source).await.map_err(|e| JobFailure::EncodeFailure {
            stage: EncodeStage::Primary,
            detail: format!("source is not readable media: {:#}", e),
        })?;
        let (width, height) = meta.dimensions().ok_or_else(|| JobFailure::EncodeFailure {
            stage: EncodeStage::Primary,
            detail: "source has no video stream with known dimensions".to_string(),
        })?;
        debug!("Source {}: {}x{}, audio: {}", source.display(), width, height, meta.has_audio());
        Ok(SourceInfo { meta, width, height })
    }

    pub fn layout_for(&self, info: &SourceInfo, profile: &EncodeProfile) -> Layout {
        geometry::compute_layout(
            self.layout,
            (info.width, info.height),
            (profile.canvas_width, profile.canvas_height),
            profile.fill_axis,
            self.max_scale_factor,
        )
    }

    pub fn build_command(&self, attempt: Attempt, source: &Path, info: &SourceInfo, profile: &EncodeProfile, output: &Path) -> Vec<String> {
        match attempt {
            Attempt::Primary => {
                let layout = self.layout_for(info, profile);
                debug!(
                    "Layout: crop {}x{}+{}+{}, scale x{:.3} -> {}x{}, offset ({}, {})",
                    layout.crop.width, layout.crop.height, layout.crop.x, layout.crop.y,
                    layout.scale_factor, layout.scaled_width, layout.scaled_height,
                    layout.offset_x, layout.offset_y
                );
                self.builder.build_primary_command(source, output, &layout, profile, info.meta.has_audio())
            }
            Attempt::Fallback => self.builder.build_fallback_command(
                source,
                output,
                (profile.canvas_width, profile.canvas_height),
                &info.meta,
            ),
        }
    }

    /// Run one encoder attempt and check it left a non-empty file. Returns the output size.
    pub async fn run(&self, attempt: Attempt, source: &Path, info: &SourceInfo, profile: &EncodeProfile, output: &Path) -> Result<u64, AttemptError> {
        let args = self.build_command(attempt, source, info, profile, output);
        info!("{:?} encode: {} -> {}", attempt, source.display(), output.display());
        self.tools.encode(args, self.encode_timeout).await?;

        let size = match tokio::fs::metadata(output).await {
            Ok(m) => m.len(),
            Err(_) => return Err(AttemptError::MissingOutput(format!("{} does not exist", output.display()))),
        };
        if size == 0 {
            remove_quietly(output).await;
            return Err(AttemptError::MissingOutput(format!("{} is empty", output.display())));
        }
        Ok(size)
    }

    /// Enforce the output size limit and collect delivery metadata
    pub async fn finalize(&self, output: PathBuf, size: u64, profile: &EncodeProfile, info: &SourceInfo) -> Result<OutputArtifact, JobFailure> {
        if size > self.max_output_bytes {
            warn!("Output {} is {} bytes, above the {} byte limit; discarding", output.display(), size, self.max_output_bytes);
            remove_quietly(&output).await;
            return Err(JobFailure::OutputTooLarge { size, limit: self.max_output_bytes });
        }

        let fallback_duration = info.meta.duration_secs().unwrap_or(0.0);
        let (width, height, duration_secs) = match self.tools.probe(&output).await {
            Ok(meta) => {
                let (w, h) = meta.dimensions().unwrap_or((profile.canvas_width, profile.canvas_height));
                (w, h, meta.duration_secs().unwrap_or(fallback_duration))
            }
            Err(e) => {
                warn!("Could not probe output {}: {:#}; reporting configured canvas", output.display(), e);
                (profile.canvas_width, profile.canvas_height, fallback_duration)
            }
        };

        Ok(OutputArtifact {
            path: output,
            width,
            height,
            duration_secs,
            size_bytes: size,
        })
    }
}

pub(crate) async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
