use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use log::{info, warn};
use crate::error::{AttemptError, EncodeStage, JobFailure};
use crate::ffmpeg::MediaTools;
use crate::job::OutputArtifact;
use crate::pipeline::{remove_quietly, Attempt, TransformPipeline};
use crate::quality::EncodeProfile;
use crate::workspace::JobWorkspace;

/// Primary encode with exactly one retry on the fallback command
pub struct FallbackChain<T: MediaTools> {
    pipeline: TransformPipeline<T>,
}

impl<T: MediaTools> FallbackChain<T> {
    pub fn new(pipeline: TransformPipeline<T>) -> Self {
        Self { pipeline }
    }

    /// Convert a staged source. `attempts` is bumped before every encoder run so the
    /// caller still sees the count if this future is dropped mid-attempt.
    pub async fn run(
        &self,
        source: &Path,
        profile: &EncodeProfile,
        workspace: &JobWorkspace,
        attempts: &AtomicU32,
    ) -> Result<OutputArtifact, JobFailure> {
        let info = self.pipeline.inspect(source).await?;

        let primary_out = workspace.primary_output();
        attempts.fetch_add(1, Ordering::SeqCst);
        let primary_err = match self.pipeline.run(Attempt::Primary, source, &info, profile, &primary_out).await {
            Ok(size) => return self.pipeline.finalize(primary_out, size, profile, &info).await,
            Err(e) => e,
        };

        if !primary_err.is_retryable() {
            warn!("Primary encode of {} failed, not retrying: {}", source.display(), primary_err);
            return Err(JobFailure::EncodeFailure {
                stage: EncodeStage::Primary,
                detail: primary_err.to_string(),
            });
        }

        info!("Primary encode of {} failed ({}), retrying with fallback command", source.display(), primary_err);
        remove_quietly(&primary_out).await;

        let fallback_out = workspace.fallback_output();
        attempts.fetch_add(1, Ordering::SeqCst);
        match self.pipeline.run(Attempt::Fallback, source, &info, profile, &fallback_out).await {
            Ok(size) => self.pipeline.finalize(fallback_out, size, profile, &info).await,
            Err(fallback_err) => {
                warn!("Fallback encode of {} failed too: {}", source.display(), fallback_err);
                Err(JobFailure::EncodeFailure {
                    stage: EncodeStage::FallbackExhausted,
                    detail: exhausted_detail(&primary_err, &fallback_err),
                })
            }
        }
    }
}

fn exhausted_detail(primary: &AttemptError, fallback: &AttemptError) -> String {
    format!("primary: {}; fallback: {}", primary, fallback)
}
