pub mod config;
pub mod error;
pub mod resource;
pub mod job;
pub mod quality;
pub mod geometry;
pub mod probe;
pub mod ffmpeg;
pub mod workspace;
pub mod ledger;
pub mod pipeline;
pub mod fallback;
pub mod controller;
pub mod scan;
pub mod sidecar;
pub mod ingest;
pub mod commands;

#[cfg(test)]
mod testing;

pub use config::{ConverterConfig, FillAxis, LayoutStrategy};
pub use error::{AttemptError, EncodeStage, ErrorCategory, JobFailure, Rejection};
pub use job::{Job, JobReport, JobRequest, JobStatus, OutputArtifact};
pub use ledger::{Account, Entitlement, LedgerLock, QuotaLedger};
pub use controller::{Controller, HostController, JobHandle};
pub use resource::{ResourceMonitor, ResourceSnapshot, StaticMonitor, SystemMonitor};
pub use quality::{EncodeProfile, QualitySelector, QualityTier};
pub use ffmpeg::{FFmpegManager, MediaTools};
pub use probe::{FFProbeData, FFProbeFormat, FFProbeStream};
pub use ingest::InboxIngest;
pub use commands::CommandFile;
