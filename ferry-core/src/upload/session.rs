//! Upload session and part bookkeeping types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::CompletedPart;

/// Store-side session of one logical upload. Immutable once created.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub session_id: String,
    pub destination_key: String,
    pub part_size: usize,
    pub worker_count: usize,
}

/// Acknowledgment of one uploaded part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    pub sequence_number: u32,
    pub etag: String,
    pub bytes: usize,
}

impl From<PartResult> for CompletedPart {
    fn from(result: PartResult) -> Self {
        CompletedPart {
            part_number: result.sequence_number,
            etag: result.etag,
        }
    }
}

/// Outcome of one dispatched chunk, as reported by a worker
#[derive(Debug)]
pub struct PartOutcome {
    pub sequence_number: u32,
    pub result: Result<PartResult>,
}

/// Confirmation of a completed upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub destination_key: String,
    pub session_id: String,
    pub part_count: u32,
    pub bytes_uploaded: u64,
    /// Object etag returned by the store; empty if it sent none
    pub etag: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl UploadReceipt {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
