//! Upload configuration
//!
//! Supplied by the caller and validated before any request reaches the store.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{FerryError, Result};
use crate::upload::retry::RetryConfig;
use crate::{DEFAULT_PART_SIZE, DEFAULT_QUEUE_DEPTH_PER_WORKER, DEFAULT_WORKER_COUNT};

/// Parameters of one upload
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Object key the file is assembled under
    pub destination_key: String,
    /// Bytes per part; every part but the last has exactly this size
    pub part_size: usize,
    /// Concurrent part uploads
    pub worker_count: usize,
    /// Chunk queue slots per worker
    pub queue_depth_per_worker: usize,
    /// Backoff for transient part failures
    pub retry: RetryConfig,
    /// Calls allowed for complete-upload, retried only on transient failures
    pub complete_attempts: u32,
    /// Upper bound on the abort-upload call
    pub abort_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            destination_key: String::new(),
            part_size: DEFAULT_PART_SIZE,
            worker_count: DEFAULT_WORKER_COUNT,
            queue_depth_per_worker: DEFAULT_QUEUE_DEPTH_PER_WORKER,
            retry: RetryConfig::default(),
            complete_attempts: 2,
            abort_timeout: Duration::from_secs(30),
        }
    }
}

impl UploadConfig {
    /// Configuration for uploading to `destination_key` with defaults elsewhere
    pub fn for_key(destination_key: impl Into<String>) -> Self {
        Self {
            destination_key: destination_key.into(),
            ..Default::default()
        }
    }

    /// Read `FERRY_DESTINATION_KEY` (required), `FERRY_PART_SIZE`,
    /// `FERRY_WORKERS`, `FERRY_QUEUE_DEPTH` and `FERRY_MAX_ATTEMPTS`
    pub fn from_env() -> Result<Self> {
        let destination_key =
            std::env::var("FERRY_DESTINATION_KEY").map_err(|_| FerryError::InvalidConfig {
                reason: "FERRY_DESTINATION_KEY is not set".into(),
            })?;

        let mut config = Self::for_key(destination_key);
        if let Some(part_size) = env_parse("FERRY_PART_SIZE")? {
            config.part_size = part_size;
        }
        if let Some(workers) = env_parse("FERRY_WORKERS")? {
            config.worker_count = workers;
        }
        if let Some(depth) = env_parse("FERRY_QUEUE_DEPTH")? {
            config.queue_depth_per_worker = depth;
        }
        if let Some(attempts) = env_parse("FERRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        Ok(config)
    }

    /// Check the configuration against the store's minimum part size
    pub fn validate(&self, min_part_size: usize) -> Result<()> {
        let invalid = |reason: String| Err(FerryError::InvalidConfig { reason });

        if self.destination_key.is_empty() {
            return invalid("destination key is empty".into());
        }
        if self.part_size == 0 {
            return invalid("part size must be positive".into());
        }
        if self.part_size < min_part_size {
            return invalid(format!(
                "part size {} is below the store minimum of {} bytes",
                self.part_size, min_part_size
            ));
        }
        if self.worker_count == 0 {
            return invalid("worker count must be at least 1".into());
        }
        if self.queue_depth_per_worker == 0 {
            return invalid("queue depth per worker must be at least 1".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("part attempts must be at least 1".into());
        }
        if self.complete_attempts == 0 {
            return invalid("completion attempts must be at least 1".into());
        }
        Ok(())
    }

    /// Capacity of the chunk and result queues
    pub fn queue_depth(&self) -> usize {
        self.worker_count.saturating_mul(self.queue_depth_per_worker)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| FerryError::InvalidConfig {
                reason: format!("{} has an invalid value: {:?}", name, raw),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::S3_MIN_PART_SIZE;

    #[test]
    fn test_defaults_are_valid_for_s3() {
        let config = UploadConfig::for_key("feeds/large.xml");
        config.validate(S3_MIN_PART_SIZE).unwrap();
        assert_eq!(config.queue_depth(), DEFAULT_WORKER_COUNT * DEFAULT_QUEUE_DEPTH_PER_WORKER);
    }

    #[test]
    fn test_rejects_parts_below_store_minimum() {
        let config = UploadConfig {
            part_size: 1024,
            ..UploadConfig::for_key("k")
        };
        let err = config.validate(S3_MIN_PART_SIZE).unwrap_err();
        assert!(matches!(err, FerryError::InvalidConfig { .. }));
        config.validate(0).unwrap();
    }

    #[test]
    fn test_rejects_empty_key_and_zero_workers() {
        assert!(UploadConfig::default().validate(0).is_err());

        let config = UploadConfig {
            worker_count: 0,
            ..UploadConfig::for_key("k")
        };
        assert!(config.validate(0).is_err());
    }
}
