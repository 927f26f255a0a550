//! In-process multipart store
//!
//! Implements the full protocol, including the checks a real store applies
//! at completion, and records every call. Faults and per-part latency can be
//! injected to exercise the pipeline's retry, abort and ordering paths.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

use super::{CompletedPart, MultipartStore, MAX_PARTS};
use crate::error::StoreError;

type DelayFn = Box<dyn Fn(u32) -> Duration + Send + Sync>;

/// Record of calls made against a [`MemoryStore`]
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    /// Number of begin-upload calls
    pub begins: u32,
    /// Part numbers in the order their uploads were attempted
    pub part_uploads: Vec<u32>,
    /// Part lists passed to complete-upload, one entry per call
    pub completions: Vec<Vec<CompletedPart>>,
    /// Session ids passed to abort-upload, one entry per call
    pub aborts: Vec<String>,
}

struct StoredPart {
    etag: String,
    body: Bytes,
}

struct OpenUpload {
    key: String,
    parts: BTreeMap<u32, StoredPart>,
}

#[derive(Default)]
struct StoreState {
    uploads: HashMap<String, OpenUpload>,
    objects: HashMap<String, Bytes>,
    begin_faults: VecDeque<StoreError>,
    part_faults: HashMap<u32, VecDeque<StoreError>>,
    complete_faults: VecDeque<StoreError>,
    calls: CallLog,
}

/// Multipart store held entirely in memory
pub struct MemoryStore {
    state: Mutex<StoreState>,
    min_part_size: usize,
    max_parts: u32,
    begin_delay: Option<Duration>,
    part_delay: Option<DelayFn>,
}

impl MemoryStore {
    /// Create a store with no minimum part size
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            min_part_size: 0,
            max_parts: MAX_PARTS,
            begin_delay: None,
            part_delay: None,
        }
    }

    /// Require every part but the last to be at least `size` bytes
    pub fn with_min_part_size(mut self, size: usize) -> Self {
        self.min_part_size = size;
        self
    }

    /// Reject part numbers above `max_parts`
    pub fn with_max_parts(mut self, max_parts: u32) -> Self {
        self.max_parts = max_parts;
        self
    }

    /// Delay every begin-upload by `delay`
    pub fn with_begin_delay(mut self, delay: Duration) -> Self {
        self.begin_delay = Some(delay);
        self
    }

    /// Delay each part upload by `delay(part_number)`
    pub fn with_part_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.part_delay = Some(Box::new(delay));
        self
    }

    /// Fail the next begin-upload with `error`
    pub fn fail_begin(&self, error: StoreError) {
        self.state.lock().begin_faults.push_back(error);
    }

    /// Fail the next `times` uploads of `part_number` with `error`
    pub fn fail_part(&self, part_number: u32, error: StoreError, times: usize) {
        let mut state = self.state.lock();
        let faults = state.part_faults.entry(part_number).or_default();
        faults.extend(std::iter::repeat(error).take(times));
    }

    /// Fail the next complete-upload with `error`
    pub fn fail_complete(&self, error: StoreError) {
        self.state.lock().complete_faults.push_back(error);
    }

    /// Snapshot of the calls made so far
    pub fn calls(&self) -> CallLog {
        self.state.lock().calls.clone()
    }

    /// Assembled object stored under `key`
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().objects.get(key).cloned()
    }

    /// Number of sessions neither completed nor aborted
    pub fn open_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    /// Part numbers currently held by a session
    pub fn uploaded_parts(&self, session_id: &str) -> Vec<u32> {
        self.state
            .lock()
            .uploads
            .get(session_id)
            .map(|upload| upload.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    fn part_etag(body: &[u8]) -> String {
        format!("\"{:08x}\"", crc32c::crc32c(body))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MultipartStore for MemoryStore {
    async fn begin_upload(&self, key: &str) -> Result<String, StoreError> {
        if let Some(delay) = self.begin_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.calls.begins += 1;
        if let Some(error) = state.begin_faults.pop_front() {
            return Err(error);
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        state.uploads.insert(
            session_id.clone(),
            OpenUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        debug!("Memory store opened upload {} for {}", session_id, key);
        Ok(session_id)
    }

    async fn upload_part(
        &self,
        session_id: &str,
        key: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StoreError> {
        if let Some(delay) = &self.part_delay {
            tokio::time::sleep(delay(part_number)).await;
        }

        let mut state = self.state.lock();
        state.calls.part_uploads.push(part_number);

        if let Some(error) = state
            .part_faults
            .get_mut(&part_number)
            .and_then(|faults| faults.pop_front())
        {
            return Err(error);
        }

        if part_number == 0 || part_number > self.max_parts {
            return Err(StoreError::fatal(format!("part number {} out of range", part_number)));
        }

        let upload = state
            .uploads
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NoSuchUpload {
                session_id: session_id.to_string(),
            })?;
        if upload.key != key {
            return Err(StoreError::fatal(format!(
                "upload {} belongs to {}, not {}",
                session_id, upload.key, key
            )));
        }

        let etag = Self::part_etag(&body);
        upload.parts.insert(
            part_number,
            StoredPart {
                etag: etag.clone(),
                body,
            },
        );
        Ok(etag)
    }

    async fn complete_upload(
        &self,
        session_id: &str,
        key: &str,
        parts: &[CompletedPart],
    ) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        state.calls.completions.push(parts.to_vec());
        if let Some(error) = state.complete_faults.pop_front() {
            return Err(error);
        }

        let upload = state
            .uploads
            .get(session_id)
            .ok_or_else(|| StoreError::NoSuchUpload {
                session_id: session_id.to_string(),
            })?;

        if parts.is_empty() {
            return Err(StoreError::fatal("MalformedXML: completion lists no parts"));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(StoreError::fatal("InvalidPartOrder: parts must be strictly ascending"));
        }

        let mut object = BytesMut::new();
        for (idx, part) in parts.iter().enumerate() {
            let stored = upload.parts.get(&part.part_number).ok_or_else(|| {
                StoreError::fatal(format!("InvalidPart: part {} was never uploaded", part.part_number))
            })?;
            if stored.etag != part.etag {
                return Err(StoreError::fatal(format!(
                    "InvalidPart: etag mismatch for part {}",
                    part.part_number
                )));
            }
            let is_last = idx + 1 == parts.len();
            if !is_last && stored.body.len() < self.min_part_size {
                return Err(StoreError::fatal(format!(
                    "EntityTooSmall: part {} is {} bytes",
                    part.part_number,
                    stored.body.len()
                )));
            }
            object.extend_from_slice(&stored.body);
        }

        let object = object.freeze();
        let etag = format!("\"{:08x}-{}\"", crc32c::crc32c(&object), parts.len());
        state.uploads.remove(session_id);
        state.objects.insert(key.to_string(), object);
        debug!("Memory store completed {} with {} parts", key, parts.len());
        Ok(etag)
    }

    async fn abort_upload(&self, session_id: &str, _key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.calls.aborts.push(session_id.to_string());
        match state.uploads.remove(session_id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NoSuchUpload {
                session_id: session_id.to_string(),
            }),
        }
    }

    fn min_part_size(&self) -> usize {
        self.min_part_size
    }

    fn max_parts(&self) -> u32 {
        self.max_parts
    }
}
