//! Bounded pool of part-upload executors
//!
//! Executors share the receiving end of the chunk queue and report every
//! chunk they take on the result queue. The result queue closes when the
//! last executor exits, which is the pool's one completion signal.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::part_uploader::PartUploader;
use super::session::{PartOutcome, UploadSession};
use crate::error::{FerryError, Result};
use crate::signal::StopSignal;
use crate::source::Chunk;

/// W concurrent executors draining one chunk queue
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `session.worker_count` executors.
    ///
    /// Executors stop taking chunks once `halt` or `cancel` is triggered;
    /// chunks still queued at that point are dropped. `cancel` additionally
    /// interrupts uploads already in flight.
    pub fn spawn(
        session: Arc<UploadSession>,
        uploader: Arc<PartUploader>,
        chunks: mpsc::Receiver<Chunk>,
        results: mpsc::Sender<PartOutcome>,
        halt: StopSignal,
        cancel: StopSignal,
    ) -> Self {
        let chunks = Arc::new(Mutex::new(chunks));
        let handles = (0..session.worker_count.max(1))
            .map(|worker_id| {
                let executor = Executor {
                    worker_id,
                    session: session.clone(),
                    uploader: uploader.clone(),
                    chunks: chunks.clone(),
                    results: results.clone(),
                    halt: halt.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(executor.run())
            })
            .collect();

        debug!("Started {} upload workers", session.worker_count);
        Self { handles }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every executor to exit, reporting the first that panicked
    pub async fn join(self) -> Result<()> {
        let mut first_failure = None;
        for (worker_id, handle) in self.handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!("Upload worker {} terminated abnormally: {}", worker_id, e);
                first_failure.get_or_insert(FerryError::Internal {
                    message: format!("upload worker {} terminated abnormally: {}", worker_id, e),
                });
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct Executor {
    worker_id: usize,
    session: Arc<UploadSession>,
    uploader: Arc<PartUploader>,
    chunks: Arc<Mutex<mpsc::Receiver<Chunk>>>,
    results: mpsc::Sender<PartOutcome>,
    halt: StopSignal,
    cancel: StopSignal,
}

impl Executor {
    async fn run(self) {
        loop {
            let next = {
                let mut chunks = self.chunks.lock().await;
                tokio::select! {
                    biased;
                    _ = self.cancel.triggered() => None,
                    _ = self.halt.triggered() => None,
                    chunk = chunks.recv() => chunk,
                }
            };

            let Some(chunk) = next else {
                break;
            };

            if self.halt.is_triggered() || self.cancel.is_triggered() {
                debug!(
                    "Worker {} dropping part {} after stop",
                    self.worker_id, chunk.sequence_number
                );
                break;
            }

            let result = self
                .uploader
                .upload(&self.session, &chunk, &self.cancel)
                .await;
            let outcome = PartOutcome {
                sequence_number: chunk.sequence_number,
                result,
            };

            if self.results.send(outcome).await.is_err() {
                debug!("Worker {}: result queue closed, stopping", self.worker_id);
                break;
            }
        }

        debug!("Worker {} finished", self.worker_id);
    }
}
