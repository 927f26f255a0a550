//! Error types for Ferry
//!
//! Two layers: [`StoreError`] is what an object-store call reports, with the
//! transient/fatal split the part uploader retries on. [`FerryError`] is the
//! terminal error of a pipeline run and names the phase it failed in.

use thiserror::Error;

use crate::store::CompletedPart;

/// Failure reported by a single object-store call
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Network failure, timeout, throttling or 5xx; safe to retry
    #[error("transient store failure: {message}")]
    Transient { message: String },

    /// Request rejected (4xx, malformed completion, bad part)
    #[error("store rejected request: {message}")]
    Fatal { message: String },

    /// The upload session is unknown to the store (expired or aborted)
    #[error("no such upload session: {session_id}")]
    NoSuchUpload { session_id: String },
}

impl StoreError {
    /// Returns true if the same request may be sent again
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }

    pub fn transient(message: impl Into<String>) -> Self {
        StoreError::Transient {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        StoreError::Fatal {
            message: message.into(),
        }
    }
}

/// Pipeline phase an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Config,
    Begin,
    Upload,
    Finalize,
    Abort,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Config => "config",
            Phase::Begin => "begin",
            Phase::Upload => "upload",
            Phase::Finalize => "finalize",
            Phase::Abort => "abort",
        };
        f.write_str(name)
    }
}

/// Terminal error of an upload
#[derive(Debug, Error)]
pub enum FerryError {
    // ========== Source Errors ==========

    /// Reading the input stream failed before end of stream
    #[error("source read failed after part {after_part}: {source}")]
    SourceRead {
        after_part: u32,
        #[source]
        source: std::io::Error,
    },

    /// Remote source could not be opened
    #[error("failed to open source {url}: {reason}")]
    SourceOpen { url: String, reason: String },

    // ========== Session Errors ==========

    /// begin-upload failed; nothing was uploaded and nothing needs cleanup
    #[error("failed to begin upload for {key}: {source}")]
    BeginUpload {
        key: String,
        #[source]
        source: StoreError,
    },

    /// Every part was uploaded but the store did not assemble the object.
    /// `parts` is the ordered list that was submitted, for manual completion.
    #[error("failed to complete upload {session_id} ({} parts uploaded): {source}", parts.len())]
    CompleteUpload {
        session_id: String,
        parts: Vec<CompletedPart>,
        #[source]
        source: StoreError,
    },

    /// abort-upload failed; server-side parts may be orphaned
    #[error("failed to abort upload {session_id}: {reason}")]
    AbortUpload { session_id: String, reason: String },

    // ========== Part Errors ==========

    /// A part failed fatally or exhausted its retries
    #[error("part {part_number} failed after {attempts} attempt(s): {source}")]
    PartUpload {
        part_number: u32,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The source holds more data than the store accepts parts for
    #[error("part {part_number} exceeds the store limit of {max_parts} parts")]
    TooManyParts { part_number: u32, max_parts: u32 },

    // ========== Runtime Errors ==========

    /// The caller cancelled the upload
    #[error("upload cancelled during {phase}")]
    Cancelled { phase: Phase },

    /// Configuration rejected before the pipeline started
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Dispatched and acknowledged parts disagree
    #[error("part bookkeeping violated: {reason}")]
    InvariantViolation { reason: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl FerryError {
    /// Phase the error belongs to
    pub fn phase(&self) -> Phase {
        match self {
            FerryError::InvalidConfig { .. } => Phase::Config,
            FerryError::BeginUpload { .. } | FerryError::SourceOpen { .. } => Phase::Begin,
            FerryError::SourceRead { .. }
            | FerryError::PartUpload { .. }
            | FerryError::TooManyParts { .. }
            | FerryError::Internal { .. } => Phase::Upload,
            FerryError::CompleteUpload { .. } | FerryError::InvariantViolation { .. } => {
                Phase::Finalize
            }
            FerryError::AbortUpload { .. } => Phase::Abort,
            FerryError::Cancelled { phase } => *phase,
        }
    }

    /// Part that caused the failure, when there is one
    pub fn part_number(&self) -> Option<u32> {
        match self {
            FerryError::PartUpload { part_number, .. }
            | FerryError::TooManyParts { part_number, .. } => Some(*part_number),
            _ => None,
        }
    }

    /// Returns true if the store may hold uploaded parts that were never assembled
    pub fn left_uploaded_parts(&self) -> bool {
        matches!(self, FerryError::CompleteUpload { .. })
    }
}

/// Result type alias for Ferry operations
pub type Result<T> = std::result::Result<T, FerryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::transient("503").is_retryable());
        assert!(!StoreError::fatal("403").is_retryable());
        assert!(!StoreError::NoSuchUpload {
            session_id: "abc".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_part_error_reports_phase_and_part() {
        let err = FerryError::PartUpload {
            part_number: 2,
            attempts: 1,
            source: StoreError::fatal("bad request"),
        };
        assert_eq!(err.phase(), Phase::Upload);
        assert_eq!(err.part_number(), Some(2));
        assert!(err.to_string().contains("part 2"));
    }

    #[test]
    fn test_too_many_parts_names_the_part() {
        let err = FerryError::TooManyParts {
            part_number: 10_001,
            max_parts: 10_000,
        };
        assert_eq!(err.phase(), Phase::Upload);
        assert_eq!(err.part_number(), Some(10_001));
        assert!(err.to_string().contains("part 10001"));
    }

    #[test]
    fn test_cancelled_keeps_phase() {
        let err = FerryError::Cancelled {
            phase: Phase::Finalize,
        };
        assert_eq!(err.phase(), Phase::Finalize);
        assert_eq!(err.part_number(), None);
        assert_eq!(err.to_string(), "upload cancelled during finalize");
    }
}
