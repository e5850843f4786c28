use std::fmt;
use serde::Serialize;
use thiserror::Error;

/// Machine-readable outcome category handed to the front-end for rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    AccountBusy,
    HostBusy,
    DurationExceeded,
    SizeExceeded,
    QuotaExceeded,
    DownloadFailure,
    EncodeFailure,
    EncodeFailureFallbackExhausted,
    OutputTooLarge,
    Timeout,
    LedgerFailure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::AccountBusy => "account_busy",
            ErrorCategory::HostBusy => "host_busy",
            ErrorCategory::DurationExceeded => "duration_exceeded",
            ErrorCategory::SizeExceeded => "size_exceeded",
            ErrorCategory::QuotaExceeded => "quota_exceeded",
            ErrorCategory::DownloadFailure => "download_failure",
            ErrorCategory::EncodeFailure => "encode_failure",
            ErrorCategory::EncodeFailureFallbackExhausted => "encode_failure_fallback_exhausted",
            ErrorCategory::OutputTooLarge => "output_too_large",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::LedgerFailure => "ledger_failure",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission-time rejection; nothing has been locked, reserved or debited
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("account {0} already has a job in flight")]
    AccountBusy(String),
    #[error("all worker slots are busy")]
    HostBusy,
    #[error("declared duration {declared:.1}s exceeds the {max:.1}s limit")]
    DurationExceeded { declared: f64, max: f64 },
    #[error("declared size {declared} bytes exceeds the {max} byte limit")]
    SizeExceeded { declared: u64, max: u64 },
    #[error("account {0} has no free trial left and no premium balance")]
    QuotaExceeded(String),
    #[error("could not record the debit: {0}")]
    LedgerUnavailable(String),
}

impl Rejection {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Rejection::AccountBusy(_) => ErrorCategory::AccountBusy,
            Rejection::HostBusy => ErrorCategory::HostBusy,
            Rejection::DurationExceeded { .. } => ErrorCategory::DurationExceeded,
            Rejection::SizeExceeded { .. } => ErrorCategory::SizeExceeded,
            Rejection::QuotaExceeded(_) => ErrorCategory::QuotaExceeded,
            Rejection::LedgerUnavailable(_) => ErrorCategory::LedgerFailure,
        }
    }

    /// Transient rejections may succeed if the same job is submitted later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Rejection::AccountBusy(_) | Rejection::HostBusy | Rejection::LedgerUnavailable(_)
        )
    }
}

/// Which encode attempt a terminal encode failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStage {
    Primary,
    FallbackExhausted,
}

/// Terminal failure of an admitted job
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobFailure {
    #[error("could not stage source: {0}")]
    DownloadFailure(String),
    #[error("encode failed ({stage:?}): {detail}")]
    EncodeFailure { stage: EncodeStage, detail: String },
    #[error("output is {size} bytes, above the {limit} byte limit")]
    OutputTooLarge { size: u64, limit: u64 },
    #[error("job exceeded the {secs}s time limit")]
    Timeout { secs: u64 },
}

impl JobFailure {
    pub fn category(&self) -> ErrorCategory {
        match self {
            JobFailure::DownloadFailure(_) => ErrorCategory::DownloadFailure,
            JobFailure::EncodeFailure { stage: EncodeStage::Primary, .. } => ErrorCategory::EncodeFailure,
            JobFailure::EncodeFailure { stage: EncodeStage::FallbackExhausted, .. } => {
                ErrorCategory::EncodeFailureFallbackExhausted
            }
            JobFailure::OutputTooLarge { .. } => ErrorCategory::OutputTooLarge,
            JobFailure::Timeout { .. } => ErrorCategory::Timeout,
        }
    }
}

/// Failure of a single encoder subprocess run
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttemptError {
    #[error("could not start encoder: {0}")]
    Spawn(String),
    #[error("encoder exited with code {code:?}: {stderr_tail}")]
    NonZeroExit { code: Option<i32>, stderr_tail: String },
    #[error("encoder timed out after {secs}s and was killed")]
    TimedOut { secs: u64 },
    #[error("encoder produced no usable output: {0}")]
    MissingOutput(String),
}

impl AttemptError {
    /// Whether a simpler command has a chance where this attempt failed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AttemptError::Spawn(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_failure_maps_to_one_category() {
        let primary = JobFailure::EncodeFailure { stage: EncodeStage::Primary, detail: "x".into() };
        let exhausted = JobFailure::EncodeFailure { stage: EncodeStage::FallbackExhausted, detail: "x".into() };
        assert_eq!(primary.category(), ErrorCategory::EncodeFailure);
        assert_eq!(exhausted.category(), ErrorCategory::EncodeFailureFallbackExhausted);
        assert_eq!(JobFailure::Timeout { secs: 1 }.category(), ErrorCategory::Timeout);
        assert_eq!(Rejection::HostBusy.category(), ErrorCategory::HostBusy);
    }

    #[test]
    fn test_transient_rejections() {
        assert!(Rejection::HostBusy.is_transient());
        assert!(Rejection::AccountBusy("7".into()).is_transient());
        assert!(Rejection::LedgerUnavailable("disk full".into()).is_transient());
        assert!(!Rejection::QuotaExceeded("7".into()).is_transient());
        assert!(!Rejection::SizeExceeded { declared: 2, max: 1 }.is_transient());
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::EncodeFailureFallbackExhausted).unwrap();
        assert_eq!(json, "\"encode_failure_fallback_exhausted\"");
        for cat in [ErrorCategory::AccountBusy, ErrorCategory::OutputTooLarge, ErrorCategory::Timeout] {
            assert_eq!(serde_json::to_string(&cat).unwrap(), format!("\"{}\"", cat));
        }
    }
}
