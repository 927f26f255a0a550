//! Single-part upload with retry

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::retry::RetryStrategy;
use super::session::{PartResult, UploadSession};
use crate::error::{FerryError, Phase, Result};
use crate::metrics::UploadMetrics;
use crate::signal::StopSignal;
use crate::source::Chunk;
use crate::store::MultipartStore;

/// Uploads one chunk as one numbered part.
///
/// Shared by every worker of a pool; calls for distinct parts of the same
/// session may run concurrently.
pub struct PartUploader {
    store: Arc<dyn MultipartStore>,
    retry: Arc<dyn RetryStrategy>,
    metrics: Arc<UploadMetrics>,
}

impl PartUploader {
    pub fn new(
        store: Arc<dyn MultipartStore>,
        retry: Arc<dyn RetryStrategy>,
        metrics: Arc<UploadMetrics>,
    ) -> Self {
        Self {
            store,
            retry,
            metrics,
        }
    }

    /// Upload `chunk`, retrying transient failures as the strategy allows.
    ///
    /// `cancel` interrupts both an in-flight transfer and a backoff sleep.
    pub async fn upload(
        &self,
        session: &UploadSession,
        chunk: &Chunk,
        cancel: &StopSignal,
    ) -> Result<PartResult> {
        let part_number = chunk.sequence_number;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let started = Instant::now();

            self.metrics.parts_in_flight.inc();
            let outcome = tokio::select! {
                biased;
                _ = cancel.triggered() => None,
                res = self.store.upload_part(
                    &session.session_id,
                    &session.destination_key,
                    part_number,
                    chunk.payload.clone(),
                ) => Some(res),
            };
            self.metrics.parts_in_flight.dec();

            let error = match outcome {
                None => {
                    debug!("Part {} interrupted by cancellation", part_number);
                    return Err(FerryError::Cancelled {
                        phase: Phase::Upload,
                    });
                }
                Some(Ok(etag)) => {
                    self.metrics.part_latency.observe(started.elapsed());
                    self.metrics.parts_uploaded.inc();
                    self.metrics.bytes_uploaded.inc_by(chunk.len() as u64);
                    debug!(
                        "Part {} uploaded ({} bytes, attempt {}), etag={}",
                        part_number,
                        chunk.len(),
                        attempt,
                        etag
                    );
                    return Ok(PartResult {
                        sequence_number: part_number,
                        etag,
                        bytes: chunk.len(),
                    });
                }
                Some(Err(e)) => e,
            };

            let Some(delay) = self.retry.next_delay(attempt, &error) else {
                self.metrics.part_failures.inc();
                return Err(FerryError::PartUpload {
                    part_number,
                    attempts: attempt,
                    source: error,
                });
            };

            warn!(
                "Attempt {} for part {} failed: {}; retrying in {:?}",
                attempt, part_number, error, delay
            );
            self.metrics.part_retries.inc();

            tokio::select! {
                biased;
                _ = cancel.triggered() => {
                    return Err(FerryError::Cancelled {
                        phase: Phase::Upload,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
