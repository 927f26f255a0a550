//! End-to-end upload pipeline tests against the in-memory store
//!
//! Run with: cargo test --test upload_pipeline

use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::error::{FerryError, Phase, StoreError};
use ferry_core::source::{ByteSource, ReaderSource};
use ferry_core::store::{MemoryStore, MultipartStore};
use ferry_core::upload::{RetryConfig, UploadState};
use ferry_core::{StopSignal, UploadConfig, UploadCoordinator};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PART: usize = 16;
const KEY: &str = "exports/catalog.xml";

/// Deterministic file content of `len` bytes
fn file_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn source(data: Vec<u8>) -> ReaderSource<Cursor<Vec<u8>>> {
    ReaderSource::new(Cursor::new(data))
}

fn config(workers: usize) -> UploadConfig {
    UploadConfig {
        part_size: PART,
        worker_count: workers,
        retry: RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        },
        abort_timeout: Duration::from_secs(2),
        ..UploadConfig::for_key(KEY)
    }
}

fn coordinator(store: &Arc<MemoryStore>, workers: usize) -> UploadCoordinator {
    UploadCoordinator::new(store.clone(), config(workers))
}

fn completed_numbers(store: &MemoryStore) -> Vec<Vec<u32>> {
    store
        .calls()
        .completions
        .iter()
        .map(|parts| parts.iter().map(|p| p.part_number).collect())
        .collect()
}

/// Hands out `remaining` bytes, then fails every read
struct BrokenSource {
    remaining: usize,
}

#[async_trait]
impl ByteSource for BrokenSource {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ));
        }
        let n = buf.len().min(self.remaining);
        buf[..n].fill(b'x');
        self.remaining -= n;
        Ok(n)
    }
}

/// Endless-looking source that records how many bytes were pulled from it
struct CountingSource {
    remaining: usize,
    read: Arc<AtomicUsize>,
}

impl CountingSource {
    fn new(len: usize) -> (Self, Arc<AtomicUsize>) {
        let read = Arc::new(AtomicUsize::new(0));
        (
            Self {
                remaining: len,
                read: read.clone(),
            },
            read,
        )
    }
}

#[async_trait]
impl ByteSource for CountingSource {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.remaining);
        buf[..n].fill(b'c');
        self.remaining -= n;
        self.read.fetch_add(n, Ordering::SeqCst);
        Ok(n)
    }
}

fn stalled_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new().with_part_delay(|_| Duration::from_secs(30)))
}

#[tokio::test]
async fn test_three_full_parts_with_two_workers() {
    let store = Arc::new(MemoryStore::new());
    let data = file_bytes(3 * PART);
    let coordinator = coordinator(&store, 2);

    let receipt = coordinator.run(source(data.clone()), StopSignal::new()).await.unwrap();

    assert_eq!(receipt.part_count, 3);
    assert_eq!(receipt.bytes_uploaded, 3 * PART as u64);
    assert_eq!(receipt.destination_key, KEY);
    assert!(receipt.finished_at >= receipt.started_at);
    assert_eq!(completed_numbers(&store), vec![vec![1, 2, 3]]);
    assert_eq!(store.object(KEY).unwrap(), Bytes::from(data));
    assert_eq!(coordinator.state(), UploadState::Completed);
    assert_eq!(coordinator.metrics().parts_uploaded.get(), 3);
    assert!(store.calls().aborts.is_empty());
}

#[tokio::test]
async fn test_short_last_part() {
    let store = Arc::new(MemoryStore::new().with_min_part_size(PART));
    let data = file_bytes(4 * PART + 5);

    let receipt = coordinator(&store, 3)
        .run(source(data.clone()), StopSignal::new())
        .await
        .unwrap();

    assert_eq!(receipt.part_count, 5);
    assert_eq!(store.object(KEY).unwrap().len(), data.len());
    assert_eq!(store.object(KEY).unwrap(), Bytes::from(data));
}

#[tokio::test]
async fn test_empty_input_completes_with_one_empty_part() {
    let store = Arc::new(MemoryStore::new());

    let receipt = coordinator(&store, 4)
        .run(source(Vec::new()), StopSignal::new())
        .await
        .unwrap();

    let calls = store.calls();
    assert_eq!(calls.begins, 1);
    assert_eq!(calls.part_uploads, vec![1]);
    assert_eq!(completed_numbers(&store), vec![vec![1]]);
    assert_eq!(receipt.part_count, 1);
    assert_eq!(receipt.bytes_uploaded, 0);
    assert!(store.object(KEY).unwrap().is_empty());
}

#[tokio::test]
async fn test_completion_list_ascending_whatever_the_arrival_order() {
    for workers in [1, 2, 3, 8] {
        // Earlier parts take longer, so later parts tend to finish first
        let store = Arc::new(
            MemoryStore::new().with_part_delay(|n| Duration::from_millis(40u64.saturating_sub(n as u64 * 4))),
        );
        let data = file_bytes(9 * PART + 3);

        let receipt = coordinator(&store, workers)
            .run(source(data.clone()), StopSignal::new())
            .await
            .unwrap();

        assert_eq!(receipt.part_count, 10, "workers={}", workers);
        assert_eq!(
            completed_numbers(&store),
            vec![(1..=10).collect::<Vec<u32>>()],
            "workers={}",
            workers
        );
        assert_eq!(store.object(KEY).unwrap(), Bytes::from(data), "workers={}", workers);
    }
}

#[tokio::test]
async fn test_fatal_part_failure_aborts_once() {
    let store = Arc::new(MemoryStore::new());
    store.fail_part(2, StoreError::fatal("AccessDenied"), 1);
    let coordinator = coordinator(&store, 2);

    let err = coordinator
        .run(source(file_bytes(5 * PART)), StopSignal::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FerryError::PartUpload { part_number: 2, attempts: 1, .. }));
    assert_eq!(err.part_number(), Some(2));
    assert_eq!(err.phase(), Phase::Upload);

    let calls = store.calls();
    assert!(calls.completions.is_empty());
    assert_eq!(calls.aborts.len(), 1);
    assert_eq!(store.open_uploads(), 0);
    assert!(store.object(KEY).is_none());
    assert_eq!(coordinator.state(), UploadState::Aborted);
}

#[tokio::test]
async fn test_transient_part_failure_is_retried_once() {
    let store = Arc::new(MemoryStore::new());
    store.fail_part(3, StoreError::transient("503 SlowDown"), 1);
    let coordinator = coordinator(&store, 2);

    let receipt = coordinator
        .run(source(file_bytes(4 * PART)), StopSignal::new())
        .await
        .unwrap();

    assert_eq!(receipt.part_count, 4);
    let attempts_for_3 = store.calls().part_uploads.iter().filter(|&&n| n == 3).count();
    assert_eq!(attempts_for_3, 2);
    assert_eq!(completed_numbers(&store), vec![vec![1, 2, 3, 4]]);
    assert_eq!(coordinator.metrics().part_retries.get(), 1);
}

#[tokio::test]
async fn test_retry_exhaustion_aborts() {
    let store = Arc::new(MemoryStore::new());
    store.fail_part(1, StoreError::transient("timeout"), 10);

    let err = coordinator(&store, 1)
        .run(source(file_bytes(2 * PART)), StopSignal::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FerryError::PartUpload { part_number: 1, attempts: 3, .. }));
    assert_eq!(store.calls().aborts.len(), 1);
}

#[tokio::test]
async fn test_source_read_error_aborts() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(&store, 2);

    let err = coordinator
        .run(BrokenSource { remaining: 2 * PART }, StopSignal::new())
        .await
        .unwrap_err();

    match err {
        FerryError::SourceRead { after_part, .. } => assert_eq!(after_part, 2),
        other => panic!("expected source failure, got {:?}", other),
    }
    let calls = store.calls();
    assert!(calls.completions.is_empty());
    assert_eq!(calls.aborts.len(), 1);
    assert_eq!(coordinator.state(), UploadState::Aborted);
}

#[tokio::test]
async fn test_cancel_mid_upload_aborts() {
    let store = Arc::new(MemoryStore::new().with_part_delay(|_| Duration::from_secs(30)));
    let coordinator = coordinator(&store, 2);
    let cancel = StopSignal::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        coordinator.run(source(file_bytes(6 * PART)), cancel),
    )
    .await
    .expect("cancellation should end the upload promptly")
    .unwrap_err();

    assert!(matches!(err, FerryError::Cancelled { phase: Phase::Upload }));
    let calls = store.calls();
    assert!(calls.completions.is_empty());
    assert_eq!(calls.aborts.len(), 1);
    assert_eq!(store.open_uploads(), 0);
}

#[tokio::test]
async fn test_cancel_before_dispatch_aborts_without_parts() {
    let store = Arc::new(MemoryStore::new());
    let cancel = StopSignal::new();
    cancel.trigger();

    let err = coordinator(&store, 2)
        .run(source(file_bytes(PART)), cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, FerryError::Cancelled { phase: Phase::Begin }));
    let calls = store.calls();
    assert!(calls.part_uploads.is_empty());
    assert_eq!(calls.aborts.len(), 1);
}

#[tokio::test]
async fn test_begin_failure_sends_nothing_else() {
    let store = Arc::new(MemoryStore::new());
    store.fail_begin(StoreError::fatal("NoSuchBucket"));
    let coordinator = coordinator(&store, 2);

    let err = coordinator
        .run(source(file_bytes(PART)), StopSignal::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FerryError::BeginUpload { .. }));
    assert_eq!(err.phase(), Phase::Begin);
    let calls = store.calls();
    assert!(calls.part_uploads.is_empty());
    assert!(calls.aborts.is_empty());
    assert_eq!(coordinator.state(), UploadState::Aborted);
}

#[tokio::test]
async fn test_rejected_completion_reports_ordered_parts() {
    let store = Arc::new(MemoryStore::new());
    store.fail_complete(StoreError::fatal("InvalidPart"));
    let coordinator = coordinator(&store, 3);

    let err = coordinator
        .run(source(file_bytes(3 * PART)), StopSignal::new())
        .await
        .unwrap_err();

    match &err {
        FerryError::CompleteUpload { parts, .. } => {
            let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
            assert_eq!(numbers, vec![1, 2, 3]);
        }
        other => panic!("expected completion failure, got {:?}", other),
    }
    assert!(err.left_uploaded_parts());
    assert_eq!(err.phase(), Phase::Finalize);
    assert!(store.calls().aborts.is_empty());
    assert_eq!(store.open_uploads(), 1);
    assert_eq!(coordinator.state(), UploadState::Aborted);
}

#[tokio::test]
async fn test_transient_completion_failure_is_retried() {
    let store = Arc::new(MemoryStore::new());
    store.fail_complete(StoreError::transient("InternalError"));

    let receipt = coordinator(&store, 2)
        .run(source(file_bytes(2 * PART)), StopSignal::new())
        .await
        .unwrap();

    assert_eq!(receipt.part_count, 2);
    assert_eq!(completed_numbers(&store), vec![vec![1, 2], vec![1, 2]]);
}

#[tokio::test]
async fn test_part_size_below_store_minimum_is_rejected() {
    let store = Arc::new(MemoryStore::new().with_min_part_size(PART * 2));

    let err = coordinator(&store, 2)
        .run(source(file_bytes(PART)), StopSignal::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FerryError::InvalidConfig { .. }));
    assert_eq!(store.calls().begins, 0);
}

#[tokio::test]
async fn test_coordinator_runs_once() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(&store, 1);
    coordinator.run(source(file_bytes(PART)), StopSignal::new()).await.unwrap();

    let err = coordinator
        .run(source(file_bytes(PART)), StopSignal::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FerryError::InvariantViolation { .. }));
    assert_eq!(store.calls().begins, 1);
}

#[tokio::test]
async fn test_reuploading_a_part_keeps_it_usable() {
    let store = MemoryStore::new();
    let session = store.begin_upload(KEY).await.unwrap();
    let body = Bytes::from(file_bytes(PART));

    let first = store.upload_part(&session, KEY, 1, body.clone()).await.unwrap();
    let second = store.upload_part(&session, KEY, 1, body.clone()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(store.uploaded_parts(&session), vec![1]);

    let parts = vec![ferry_core::store::CompletedPart {
        part_number: 1,
        etag: second,
    }];
    store.complete_upload(&session, KEY, &parts).await.unwrap();
    assert_eq!(store.object(KEY).unwrap(), body);
}

#[tokio::test]
async fn test_concurrent_runs_open_one_session() {
    let store = Arc::new(MemoryStore::new().with_begin_delay(Duration::from_millis(50)));
    let coordinator = coordinator(&store, 2);

    let (first, second) = tokio::join!(
        coordinator.run(source(file_bytes(2 * PART)), StopSignal::new()),
        coordinator.run(source(file_bytes(2 * PART)), StopSignal::new()),
    );

    let (ok, rejected) = match (first, second) {
        (Ok(receipt), Err(e)) | (Err(e), Ok(receipt)) => (receipt, e),
        (a, b) => panic!("expected exactly one successful run, got {:?} and {:?}", a, b),
    };
    assert_eq!(ok.part_count, 2);
    assert!(matches!(rejected, FerryError::InvariantViolation { .. }));

    let calls = store.calls();
    assert_eq!(calls.begins, 1);
    assert!(calls.aborts.is_empty());
    assert_eq!(store.open_uploads(), 0);
}

#[tokio::test]
async fn test_slow_store_bounds_parts_read_ahead() {
    for workers in [1, 2, 4] {
        let store = stalled_store();
        let config = config(workers);
        let bound = config.worker_count + config.queue_depth() + 1;
        let coordinator = UploadCoordinator::new(store.clone(), config);
        let (counting, read) = CountingSource::new(1000 * PART);
        let cancel = StopSignal::new();

        let run = coordinator.run(counting, cancel.clone());
        let observe = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let parts_read = read.load(Ordering::SeqCst) / PART;
            cancel.trigger();
            parts_read
        };
        let (result, parts_read) = tokio::join!(run, observe);

        assert!(
            parts_read <= bound,
            "workers={} read {} parts ahead of a stalled store, bound {}",
            workers,
            parts_read,
            bound
        );
        assert!(parts_read >= workers, "workers={} read only {} parts", workers, parts_read);
        assert!(matches!(result, Err(FerryError::Cancelled { .. })));
    }
}

#[tokio::test]
async fn test_cancel_stops_reading_the_source() {
    let store = stalled_store();
    let coordinator = coordinator(&store, 2);
    let (counting, read) = CountingSource::new(1000 * PART);
    let cancel = StopSignal::new();

    let run = coordinator.run(counting, cancel.clone());
    let observe = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let at_cancel = read.load(Ordering::SeqCst);
        cancel.trigger();
        at_cancel
    };
    let (result, at_cancel) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(run, observe)
    })
    .await
    .expect("cancellation should end the upload promptly");

    assert!(matches!(result, Err(FerryError::Cancelled { phase: Phase::Upload })));
    assert_eq!(read.load(Ordering::SeqCst), at_cancel);
    assert!(store.calls().part_uploads.is_empty());
    assert_eq!(store.calls().aborts.len(), 1);
}

#[tokio::test]
async fn test_cancel_interrupts_completion_backoff() {
    let store = Arc::new(MemoryStore::new());
    store.fail_complete(StoreError::transient("InternalError"));
    let config = UploadConfig {
        retry: RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
        },
        ..config(2)
    };
    let coordinator = UploadCoordinator::new(store.clone(), config);
    let cancel = StopSignal::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.trigger();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        coordinator.run(source(file_bytes(2 * PART)), cancel),
    )
    .await
    .expect("cancellation should cut the completion backoff short")
    .unwrap_err();

    assert!(matches!(err, FerryError::Cancelled { phase: Phase::Finalize }));
    let calls = store.calls();
    assert_eq!(calls.completions.len(), 1);
    assert_eq!(calls.aborts.len(), 1);
    assert_eq!(coordinator.state(), UploadState::Aborted);
}

#[tokio::test]
async fn test_source_larger_than_part_limit_fails_on_first_extra_part() {
    let store = Arc::new(MemoryStore::new().with_max_parts(3));
    let coordinator = coordinator(&store, 2);

    let err = coordinator
        .run(source(file_bytes(3 * PART + 1)), StopSignal::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FerryError::TooManyParts { part_number: 4, max_parts: 3 }));
    assert_eq!(err.part_number(), Some(4));
    let calls = store.calls();
    assert!(!calls.part_uploads.contains(&4));
    assert!(calls.completions.is_empty());
    assert_eq!(calls.aborts.len(), 1);
}

#[tokio::test]
async fn test_source_at_part_limit_completes() {
    let store = Arc::new(MemoryStore::new().with_max_parts(3));

    let receipt = coordinator(&store, 2)
        .run(source(file_bytes(3 * PART)), StopSignal::new())
        .await
        .unwrap();
    assert_eq!(receipt.part_count, 3);
}
