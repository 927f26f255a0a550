//! S3-compatible multipart store
//!
//! Pure-Rust async client using reqwest against path-style S3 endpoints.
//! Requests are sent unsigned; deployments front it with a signing gateway
//! or grant the uploader's network bucket access.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use std::time::Duration;
use tracing::{debug, warn};

use super::{CompletedPart, MultipartStore, S3_MIN_PART_SIZE};
use crate::error::StoreError;

/// Configuration for the S3 store
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 endpoint URL
    pub endpoint: String,
    /// Bucket name
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Request timeout in seconds; must cover one part transfer
    pub request_timeout_secs: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".into(),
            bucket: "ferry".into(),
            region: "us-east-1".into(),
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
        }
    }
}

impl S3Config {
    /// Read `S3_ENDPOINT`, `S3_BUCKET` and `S3_REGION`, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: std::env::var("S3_ENDPOINT").unwrap_or(defaults.endpoint),
            bucket: std::env::var("S3_BUCKET").unwrap_or(defaults.bucket),
            region: std::env::var("S3_REGION").unwrap_or(defaults.region),
            ..defaults
        }
    }
}

/// Multipart store speaking the S3 REST API
pub struct S3Store {
    client: Client,
    config: S3Config,
}

impl S3Store {
    /// Create a new S3 store
    pub fn new(config: S3Config) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| StoreError::fatal(format!("failed to create HTTP client: {}", e)))?;

        debug!(
            "S3 store at {} (bucket {}, region {})",
            config.endpoint, config.bucket, config.region
        );
        Ok(Self { client, config })
    }

    /// Build the URL for an object, one path segment per key component
    fn object_url(&self, key: &str) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.config.endpoint)
            .map_err(|e| StoreError::fatal(format!("invalid endpoint {}: {}", self.config.endpoint, e)))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::fatal(format!("endpoint {} cannot carry a path", self.config.endpoint)))?
            .pop_if_empty()
            .push(&self.config.bucket)
            .extend(key.split('/'));
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Get bucket name
    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }
}

#[async_trait]
impl MultipartStore for S3Store {
    async fn begin_upload(&self, key: &str) -> Result<String, StoreError> {
        let mut url = self.object_url(key)?;
        url.set_query(Some("uploads"));

        let resp = send(self.request(Method::POST, url), "create multipart upload").await?;
        let resp = check_status(resp, None).await?;
        let body = read_body(resp).await?;

        match xml_value(&body, "UploadId") {
            Some(id) if !id.is_empty() => {
                debug!("Created multipart upload {} for {}", id, key);
                Ok(id)
            }
            _ => Err(StoreError::fatal(format!(
                "create multipart upload for {} returned no UploadId",
                key
            ))),
        }
    }

    async fn upload_part(
        &self,
        session_id: &str,
        key: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StoreError> {
        let mut url = self.object_url(key)?;
        url.query_pairs_mut()
            .append_pair("partNumber", &part_number.to_string())
            .append_pair("uploadId", session_id);

        let len = body.len();
        let resp = send(self.request(Method::PUT, url).body(body), "upload part").await?;
        let resp = check_status(resp, Some(session_id)).await?;

        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                StoreError::transient(format!("part {} response carried no ETag", part_number))
            })?;

        debug!("Uploaded part {} ({} bytes), etag={}", part_number, len, etag);
        Ok(etag)
    }

    async fn complete_upload(
        &self,
        session_id: &str,
        key: &str,
        parts: &[CompletedPart],
    ) -> Result<String, StoreError> {
        let mut url = self.object_url(key)?;
        url.query_pairs_mut().append_pair("uploadId", session_id);

        let resp = send(
            self.request(Method::POST, url)
                .header(reqwest::header::CONTENT_TYPE, "application/xml")
                .body(completion_body(parts)),
            "complete multipart upload",
        )
        .await?;
        let resp = check_status(resp, Some(session_id)).await?;
        let body = read_body(resp).await?;

        // S3 can report a completion failure inside a 200 response.
        if body.contains("<Error>") {
            let code = xml_value(&body, "Code").unwrap_or_default();
            let message = xml_value(&body, "Message").unwrap_or_default();
            return if code == "InternalError" || code == "SlowDown" {
                Err(StoreError::transient(format!("{}: {}", code, message)))
            } else {
                Err(StoreError::fatal(format!("{}: {}", code, message)))
            };
        }

        Ok(xml_value(&body, "ETag").unwrap_or_default())
    }

    async fn abort_upload(&self, session_id: &str, key: &str) -> Result<(), StoreError> {
        let mut url = self.object_url(key)?;
        url.query_pairs_mut().append_pair("uploadId", session_id);

        let resp = send(self.request(Method::DELETE, url), "abort multipart upload").await?;
        if resp.status() == StatusCode::NOT_FOUND {
            warn!("Upload {} was already gone when aborting", session_id);
            return Ok(());
        }
        check_status(resp, Some(session_id)).await?;
        Ok(())
    }

    fn min_part_size(&self) -> usize {
        S3_MIN_PART_SIZE
    }
}

async fn send(request: RequestBuilder, action: &str) -> Result<Response, StoreError> {
    request.send().await.map_err(|e| {
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            StoreError::transient(format!("{} failed: {}", action, e))
        } else {
            StoreError::fatal(format!("{} failed: {}", action, e))
        }
    })
}

async fn read_body(resp: Response) -> Result<String, StoreError> {
    resp.text()
        .await
        .map_err(|e| StoreError::transient(format!("failed to read response body: {}", e)))
}

/// Map a non-success status to the transient/fatal split
async fn check_status(resp: Response, session_id: Option<&str>) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let code = xml_value(&body, "Code").unwrap_or_default();
    Err(classify_status(status, &code, session_id))
}

fn classify_status(status: StatusCode, code: &str, session_id: Option<&str>) -> StoreError {
    if code == "NoSuchUpload" || (status == StatusCode::NOT_FOUND && session_id.is_some()) {
        return StoreError::NoSuchUpload {
            session_id: session_id.unwrap_or_default().to_string(),
        };
    }

    let message = if code.is_empty() {
        format!("status {}", status)
    } else {
        format!("status {} ({})", status, code)
    };

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        StoreError::transient(message)
    } else {
        StoreError::fatal(message)
    }
}

/// Render the CompleteMultipartUpload request body
fn completion_body(parts: &[CompletedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number,
            escape_xml(&part.etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Text of the first `<tag>` element (simplified XML extraction)
fn xml_value(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(
        body[start..end]
            .replace("&quot;", "\"")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&amp;", "&"),
    )
}
