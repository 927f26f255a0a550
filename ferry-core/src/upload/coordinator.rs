//! Upload coordinator
//!
//! Drives one upload through begin → dispatch → collect → complete, or
//! abort on the first fatal failure. The coordinator is the only reader of
//! the result queue and the only owner of the collected part list, so no
//! part bookkeeping is shared with the workers.

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::part_uploader::PartUploader;
use super::retry::{ExponentialBackoff, RetryStrategy};
use super::session::{PartOutcome, PartResult, UploadReceipt, UploadSession};
use super::state::UploadState;
use super::worker_pool::WorkerPool;
use crate::config::UploadConfig;
use crate::error::{FerryError, Phase, Result};
use crate::metrics::UploadMetrics;
use crate::signal::StopSignal;
use crate::source::{ByteSource, Chunk, ChunkReader};
use crate::store::{CompletedPart, MultipartStore};

/// Orchestrates a single multipart upload
pub struct UploadCoordinator {
    store: Arc<dyn MultipartStore>,
    config: UploadConfig,
    retry: Arc<dyn RetryStrategy>,
    metrics: Arc<UploadMetrics>,
    state: Mutex<UploadState>,
    claimed: AtomicBool,
}

impl UploadCoordinator {
    /// Create a coordinator retrying parts with exponential backoff
    pub fn new(store: Arc<dyn MultipartStore>, config: UploadConfig) -> Self {
        let retry = Arc::new(ExponentialBackoff::new(config.retry.clone()));
        Self {
            store,
            config,
            retry,
            metrics: Arc::new(UploadMetrics::new()),
            state: Mutex::new(UploadState::Idle),
            claimed: AtomicBool::new(false),
        }
    }

    /// Replace the part retry strategy
    pub fn with_retry_strategy(mut self, retry: Arc<dyn RetryStrategy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> UploadState {
        *self.state.lock()
    }

    pub fn metrics(&self) -> Arc<UploadMetrics> {
        self.metrics.clone()
    }

    /// Stream `source` into the store under the configured key.
    ///
    /// Returns once the object is assembled or the upload has been aborted.
    /// Triggering `cancel` aborts the upload at any point before completion.
    pub async fn run<S>(&self, source: S, cancel: StopSignal) -> Result<UploadReceipt>
    where
        S: ByteSource + 'static,
    {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return Err(FerryError::InvariantViolation {
                reason: format!("coordinator already used (state {})", self.state()),
            });
        }
        self.config.validate(self.store.min_part_size())?;

        let started_at = Utc::now();
        let key = self.config.destination_key.clone();

        let session_id = match self.store.begin_upload(&key).await {
            Ok(id) => id,
            Err(source) => {
                error!("Failed to begin upload for {}: {}", key, source);
                self.transition(UploadState::Aborted)?;
                return Err(FerryError::BeginUpload { key, source });
            }
        };
        self.transition(UploadState::Started)?;

        let session = Arc::new(UploadSession {
            session_id,
            destination_key: key,
            part_size: self.config.part_size,
            worker_count: self.config.worker_count,
        });
        info!(
            "Started upload {} for {} ({} byte parts, {} workers)",
            session.session_id, session.destination_key, session.part_size, session.worker_count
        );

        if cancel.is_triggered() {
            return Err(self.abort(&session, FerryError::Cancelled { phase: Phase::Begin }).await);
        }

        self.transition(UploadState::Uploading)?;
        let parts = match self.upload_parts(&session, source, &cancel).await {
            Ok(parts) => parts,
            Err(e) => return Err(self.abort(&session, e).await),
        };

        self.transition(UploadState::Finalizing)?;
        self.finalize(&session, parts, started_at, &cancel).await
    }

    /// Run reader and workers until every dispatched part has an outcome
    async fn upload_parts<S>(
        &self,
        session: &Arc<UploadSession>,
        source: S,
        cancel: &StopSignal,
    ) -> Result<Vec<PartResult>>
    where
        S: ByteSource + 'static,
    {
        let depth = self.config.queue_depth();
        let (chunk_tx, chunk_rx) = mpsc::channel::<Chunk>(depth);
        let (result_tx, mut result_rx) = mpsc::channel::<PartOutcome>(depth);
        let halt = StopSignal::new();

        let reader = ChunkReader::new(source, session.part_size);
        let producer = tokio::spawn(dispatch_chunks(
            reader,
            chunk_tx,
            halt.clone(),
            cancel.clone(),
            self.store.max_parts(),
        ));

        let uploader = Arc::new(PartUploader::new(
            self.store.clone(),
            self.retry.clone(),
            self.metrics.clone(),
        ));
        let pool = WorkerPool::spawn(
            session.clone(),
            uploader,
            chunk_rx,
            result_tx,
            halt.clone(),
            cancel.clone(),
        );

        let mut collected = Vec::new();
        let mut first_error: Option<FerryError> = None;
        let mut cancel_seen = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.triggered(), if !cancel_seen => {
                    cancel_seen = true;
                    warn!("Upload {} cancelled, halting dispatch", session.session_id);
                    halt.trigger();
                    first_error.get_or_insert(FerryError::Cancelled { phase: Phase::Upload });
                }
                outcome = result_rx.recv() => match outcome {
                    Some(PartOutcome { result: Ok(part), .. }) => {
                        trace!("Collected part {}", part.sequence_number);
                        collected.push(part);
                    }
                    Some(PartOutcome { sequence_number, result: Err(e) }) => {
                        if first_error.is_none() {
                            error!("Part {} failed, halting dispatch: {}", sequence_number, e);
                            halt.trigger();
                            first_error = Some(e);
                        } else {
                            debug!("Discarding later failure of part {}: {}", sequence_number, e);
                        }
                    }
                    None => break,
                },
            }
        }

        if cancel.is_triggered() && first_error.is_none() {
            first_error = Some(FerryError::Cancelled { phase: Phase::Upload });
        }

        let dispatched = match producer.await {
            Ok(Ok(dispatched)) => Some(dispatched),
            Ok(Err(e)) => {
                if first_error.is_none() {
                    error!("Reading source failed: {}", e);
                    first_error = Some(e);
                }
                None
            }
            Err(e) => {
                first_error.get_or_insert(FerryError::Internal {
                    message: format!("chunk producer terminated abnormally: {}", e),
                });
                None
            }
        };
        let pool_health = pool.join().await;

        if let Some(e) = first_error {
            return Err(e);
        }
        pool_health?;

        let dispatched = dispatched.ok_or_else(|| FerryError::Internal {
            message: "chunk producer reported no part count".into(),
        })?;
        order_parts(collected, dispatched)
    }

    /// Submit the ordered part list, retrying only transient failures
    async fn finalize(
        &self,
        session: &UploadSession,
        parts: Vec<PartResult>,
        started_at: chrono::DateTime<Utc>,
        cancel: &StopSignal,
    ) -> Result<UploadReceipt> {
        let bytes_uploaded: u64 = parts.iter().map(|p| p.bytes as u64).sum();
        let completed: Vec<CompletedPart> = parts.into_iter().map(CompletedPart::from).collect();
        let mut attempt = 0;

        loop {
            if cancel.is_triggered() {
                return Err(self.abort(session, FerryError::Cancelled { phase: Phase::Finalize }).await);
            }
            attempt += 1;

            match self
                .store
                .complete_upload(&session.session_id, &session.destination_key, &completed)
                .await
            {
                Ok(etag) => {
                    self.transition(UploadState::Completed)?;
                    info!(
                        "Completed upload of {} ({} parts, {} bytes)",
                        session.destination_key,
                        completed.len(),
                        bytes_uploaded
                    );
                    return Ok(UploadReceipt {
                        destination_key: session.destination_key.clone(),
                        session_id: session.session_id.clone(),
                        part_count: completed.len() as u32,
                        bytes_uploaded,
                        etag,
                        started_at,
                        finished_at: Utc::now(),
                    });
                }
                Err(e) if e.is_retryable() && attempt < self.config.complete_attempts => {
                    warn!(
                        "Completion attempt {} for {} failed: {}; retrying",
                        attempt, session.session_id, e
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.triggered() => {}
                        _ = tokio::time::sleep(self.config.retry.base_delay) => {}
                    }
                }
                Err(e) => {
                    error!(
                        "Store did not assemble {} from {} uploaded parts: {}",
                        session.destination_key,
                        completed.len(),
                        e
                    );
                    self.transition(UploadState::Aborted)?;
                    return Err(FerryError::CompleteUpload {
                        session_id: session.session_id.clone(),
                        parts: completed,
                        source: e,
                    });
                }
            }
        }
    }

    /// Release the session on the store, best effort, and hand back `cause`
    async fn abort(&self, session: &UploadSession, cause: FerryError) -> FerryError {
        if let Err(e) = self.transition(UploadState::Aborted) {
            error!("{}", e);
        }
        warn!(
            "Aborting upload {} of {}: {}",
            session.session_id, session.destination_key, cause
        );

        let call = self
            .store
            .abort_upload(&session.session_id, &session.destination_key);
        let failure = match tokio::time::timeout(self.config.abort_timeout, call).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("no response within {:?}", self.config.abort_timeout)),
        };

        match failure {
            None => info!("Aborted upload {}", session.session_id),
            Some(reason) => {
                let err = FerryError::AbortUpload {
                    session_id: session.session_id.clone(),
                    reason,
                };
                error!("{}; uploaded parts may remain on the store", err);
            }
        }
        cause
    }

    fn transition(&self, next: UploadState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(FerryError::InvariantViolation {
                reason: format!("illegal transition {} -> {}", *state, next),
            });
        }
        debug!("Upload state {} -> {}", *state, next);
        *state = next;
        Ok(())
    }
}

/// Feed chunks into the pool in read order; returns the number dispatched.
///
/// An empty source is dispatched as a single zero-byte part so the upload
/// can still be completed. Reading stops as soon as either `halt` or
/// `cancel` fires, and fails once the source outgrows `max_parts`.
async fn dispatch_chunks<S: ByteSource>(
    mut reader: ChunkReader<S>,
    chunks: mpsc::Sender<Chunk>,
    halt: StopSignal,
    cancel: StopSignal,
    max_parts: u32,
) -> Result<u32> {
    let mut dispatched = 0u32;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.triggered() => break,
            _ = halt.triggered() => break,
            next = reader.next_chunk() => next,
        };

        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) if dispatched == 0 => {
                debug!("Source was empty, dispatching one zero-byte part");
                Chunk::new(1, Bytes::new())
            }
            Ok(None) => break,
            Err(e) => {
                halt.trigger();
                return Err(e);
            }
        };

        let sequence_number = chunk.sequence_number;
        if sequence_number > max_parts {
            halt.trigger();
            return Err(FerryError::TooManyParts {
                part_number: sequence_number,
                max_parts,
            });
        }

        tokio::select! {
            biased;
            _ = cancel.triggered() => break,
            _ = halt.triggered() => break,
            sent = chunks.send(chunk) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        dispatched += 1;
        trace!("Dispatched part {}", sequence_number);
    }

    debug!("Dispatched {} parts", dispatched);
    Ok(dispatched)
}

/// Sort acknowledged parts and check they are exactly 1..=dispatched
fn order_parts(mut parts: Vec<PartResult>, dispatched: u32) -> Result<Vec<PartResult>> {
    parts.sort_by_key(|p| p.sequence_number);

    if parts.len() != dispatched as usize {
        return Err(FerryError::InvariantViolation {
            reason: format!("{} parts dispatched but {} acknowledged", dispatched, parts.len()),
        });
    }
    for (expected, part) in (1u32..).zip(&parts) {
        if part.sequence_number != expected {
            return Err(FerryError::InvariantViolation {
                reason: format!(
                    "expected part {} but found part {}",
                    expected, part.sequence_number
                ),
            });
        }
    }
    Ok(parts)
}
