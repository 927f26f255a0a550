//! Upload pipeline
//!
//! One [`UploadCoordinator`] per file. It reads chunks, fans them out to a
//! [`WorkerPool`] through a bounded queue, gathers acknowledgments and
//! finishes the store session.

pub mod coordinator;
pub mod part_uploader;
pub mod retry;
pub mod session;
pub mod state;
pub mod worker_pool;

pub use coordinator::UploadCoordinator;
pub use part_uploader::PartUploader;
pub use retry::{ExponentialBackoff, NoRetry, RetryConfig, RetryStrategy};
pub use session::{PartOutcome, PartResult, UploadReceipt, UploadSession};
pub use state::UploadState;
pub use worker_pool::WorkerPool;
