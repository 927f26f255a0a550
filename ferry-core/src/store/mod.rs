//! Object-store side of the pipeline
//!
//! The multipart protocol is reduced to four calls. Implementations must
//! accept concurrent `upload_part` calls for distinct part numbers of one
//! session, and treat a repeated part number as an overwrite.

pub mod memory;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use s3::{S3Config, S3Store};

/// Minimum size of every part except the last (5 MiB), as S3 requires
pub const S3_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Highest part number a multipart upload may use
pub const MAX_PARTS: u32 = 10_000;

/// Entry of the completion list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Multipart upload primitives
#[async_trait]
pub trait MultipartStore: Send + Sync {
    /// Open a session for `key`, returning the store's session id
    async fn begin_upload(&self, key: &str) -> Result<String, StoreError>;

    /// Upload one part, returning its etag
    async fn upload_part(
        &self,
        session_id: &str,
        key: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StoreError>;

    /// Assemble the object from `parts`, which must be in ascending order.
    /// Returns the object's etag, or an empty string if the store sends none.
    async fn complete_upload(
        &self,
        session_id: &str,
        key: &str,
        parts: &[CompletedPart],
    ) -> Result<String, StoreError>;

    /// Discard the session and every part uploaded under it
    async fn abort_upload(&self, session_id: &str, key: &str) -> Result<(), StoreError>;

    /// Smallest size accepted for any part but the last
    fn min_part_size(&self) -> usize;

    /// Highest part number accepted in one session
    fn max_parts(&self) -> u32 {
        MAX_PARTS
    }
}
