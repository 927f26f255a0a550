//! Upload binary
//!
//! Streams `FERRY_SOURCE_URL` into the configured bucket under
//! `FERRY_DESTINATION_KEY`. Ctrl-C cancels and aborts the upload.

use ferry_core::source::http::{HttpSource, HttpSourceConfig};
use ferry_core::store::{S3Config, S3Store};
use ferry_core::{FerryError, StopSignal, UploadConfig, UploadCoordinator};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Upload failed during {}: {}", e.phase(), e);
            if let FerryError::CompleteUpload { session_id, parts, .. } = &e {
                // Enough for an operator to complete or abort the session by hand
                match serde_json::to_string_pretty(parts) {
                    Ok(json) => println!("{}", json),
                    Err(e) => error!("Failed to render parts of {}: {}", session_id, e),
                }
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), FerryError> {
    let source_url = std::env::var("FERRY_SOURCE_URL").map_err(|_| FerryError::InvalidConfig {
        reason: "FERRY_SOURCE_URL is not set".into(),
    })?;
    let config = UploadConfig::from_env()?;
    let s3_config = S3Config::from_env();

    info!("Starting upload of {} to {}/{}", source_url, s3_config.bucket, config.destination_key);

    let store = S3Store::new(s3_config).map_err(|e| FerryError::InvalidConfig {
        reason: format!("cannot create store client: {}", e),
    })?;
    let source = HttpSource::open(&source_url, &HttpSourceConfig::default()).await?;
    if let Some(length) = source.content_length() {
        info!("Source reports {} bytes", length);
    }

    let cancel = StopSignal::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling upload");
            on_interrupt.trigger();
        }
    });

    let coordinator = UploadCoordinator::new(Arc::new(store), config);
    let result = coordinator.run(source, cancel).await;
    info!("Upload metrics:\n{}", coordinator.metrics().to_prometheus());

    let receipt = result?;
    match receipt.to_json() {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("Failed to render receipt: {}", e),
    }
    Ok(())
}
