//! Ferry Core - streaming multipart uploads into object stores
//!
//! This crate moves a file of unknown length from a sequential byte source
//! into an S3-compatible store without holding the file in memory:
//! - Part-sized chunking of any byte stream
//! - Bounded concurrent part uploads with retry
//! - Ordered completion, or abort on the first fatal failure
//! - Cooperative cancellation

pub mod config;
pub mod error;
pub mod metrics;
pub mod signal;
pub mod source;
pub mod store;
pub mod upload;

pub use config::UploadConfig;
pub use error::{FerryError, Phase, StoreError};
pub use signal::StopSignal;
pub use upload::{UploadCoordinator, UploadReceipt};

/// Default part size, the S3 minimum for every part but the last
pub const DEFAULT_PART_SIZE: usize = 5 * 1024 * 1024;

/// Default number of concurrent part uploads
pub const DEFAULT_WORKER_COUNT: usize = 5;

/// Default chunk queue slots per worker
pub const DEFAULT_QUEUE_DEPTH_PER_WORKER: usize = 2;
