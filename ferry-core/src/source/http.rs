//! Remote file source over HTTP
//!
//! Streams the response body of a GET request. At most one network chunk is
//! held between reads.

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::{debug, info};

use super::ByteSource;
use crate::error::{FerryError, Result};

/// Configuration for the HTTP source
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Read timeout between body chunks in seconds
    pub read_timeout_secs: u64,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
        }
    }
}

/// Streaming GET of a remote file
pub struct HttpSource {
    response: Response,
    pending: Bytes,
    url: String,
    received: u64,
}

impl HttpSource {
    /// Issue the GET request and wait for response headers
    pub async fn open(url: &str, config: &HttpSourceConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .build()
            .map_err(|e| FerryError::SourceOpen {
                url: url.to_string(),
                reason: format!("failed to create HTTP client: {}", e),
            })?;

        Self::open_with(&client, url).await
    }

    /// Issue the GET request with an existing client
    pub async fn open_with(client: &Client, url: &str) -> Result<Self> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| FerryError::SourceOpen {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(FerryError::SourceOpen {
                url: url.to_string(),
                reason: format!("status {}", response.status()),
            });
        }

        match response.content_length() {
            Some(len) => info!("Streaming {} ({} bytes)", url, len),
            None => info!("Streaming {} (length unknown)", url),
        }

        Ok(Self {
            response,
            pending: Bytes::new(),
            url: url.to_string(),
            received: 0,
        })
    }

    /// Declared body length, if the server sent one
    pub fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }
}

#[async_trait]
impl ByteSource for HttpSource {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pending.is_empty() {
            match self.response.chunk().await {
                Ok(Some(chunk)) => {
                    self.received += chunk.len() as u64;
                    self.pending = chunk;
                }
                Ok(None) => {
                    debug!("Body of {} finished after {} bytes", self.url, self.received);
                    return Ok(0);
                }
                Err(e) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, e));
                }
            }
        }

        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}
