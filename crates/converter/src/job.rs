use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::{ErrorCategory, JobFailure};
use crate::quality::EncodeProfile;

/// Job descriptor handed in by the ingest collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub account_id: String,
    /// Already-fetched source bytes on local disk
    pub source: PathBuf,
    pub declared_duration_secs: f64,
    pub declared_size_bytes: u64,
}

impl JobRequest {
    pub fn new(account_id: impl Into<String>, source: impl Into<PathBuf>, declared_duration_secs: f64, declared_size_bytes: u64) -> Self {
        Self {
            account_id: account_id.into(),
            source: source.into(),
            declared_duration_secs,
            declared_size_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Admitted,
    Running,
    Succeeded,
    Failed,
}

/// An admitted job, owned by the worker running it
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub account_id: String,
    pub source_path: PathBuf,
    pub declared_duration_secs: f64,
    pub declared_size_bytes: u64,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub profile_used: Option<EncodeProfile>,
    pub admitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn admit(request: JobRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: request.account_id,
            source_path: request.source,
            declared_duration_secs: request.declared_duration_secs,
            declared_size_bytes: request.declared_size_bytes,
            status: JobStatus::Admitted,
            attempt_count: 0,
            profile_used: None,
            admitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, succeeded: bool) {
        self.status = if succeeded { JobStatus::Succeeded } else { JobStatus::Failed };
        self.finished_at = Some(Utc::now());
    }
}

/// Delivered artifact with the metadata the delivery collaborator needs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputArtifact {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub duration_secs: f64,
    pub size_bytes: u64,
}

/// Terminal report for a job
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub account_id: String,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub profile_used: Option<EncodeProfile>,
    pub outcome: Result<OutputArtifact, JobFailure>,
    pub elapsed: chrono::Duration,
    /// Set when the completion record could not be written; the debit made at
    /// admission is already durable
    pub ledger_error: Option<String>,
}

impl JobReport {
    pub fn failure_category(&self) -> Option<ErrorCategory> {
        self.outcome.as_ref().err().map(JobFailure::category)
    }
}
