//! JSON files at the edges of a batch.
//!
//! # Files
//!
//! | File | Shape | Direction |
//! |------|-------|-----------|
//! | URL list | `["https://…", "https://…"]` | read, and written by `--export-urls` |
//! | Records | `[{"url": …, "status": "success", …}, …]` | written once per batch |
//!
//! The URL list is a plain JSON array of UTF-8 strings with nothing after it;
//! reading then writing a list gives back the same strings in the same order.

use std::error::Error;
use std::path::Path;
use tokio::fs;
use tracing::{error, info, instrument};

use crate::models::IngestRecord;
use crate::utils::ensure_writable_parent;

/// Read a URL list file.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn read_url_list(path: &Path) -> Result<Vec<String>, Box<dyn Error>> {
    let raw = fs::read_to_string(path).await.map_err(|e| {
        error!(error = %e, "Failed to read URL list");
        e
    })?;
    let urls: Vec<String> = serde_json::from_str(&raw)?;
    info!(count = urls.len(), "Read URL list");
    Ok(urls)
}

/// Write a URL list file.
#[instrument(level = "info", skip_all, fields(path = %path.display(), count = urls.len()))]
pub async fn write_url_list(urls: &[String], path: &Path) -> Result<(), Box<dyn Error>> {
    ensure_writable_parent(path).await?;
    let json = serde_json::to_string(urls)?;
    fs::write(path, json).await?;
    info!("Wrote URL list");
    Ok(())
}

/// Write the batch's outbound records as one pretty-printed JSON array.
#[instrument(level = "info", skip_all, fields(path = %path.display(), count = records.len()))]
pub async fn write_records(records: &[IngestRecord], path: &Path) -> Result<(), Box<dyn Error>> {
    ensure_writable_parent(path).await?;
    let json = serde_json::to_string_pretty(records)?;
    if let Err(e) = fs::write(path, json).await {
        error!(error = %e, "Failed to write records");
        return Err(e.into());
    }
    info!("Wrote ingestion records");
    Ok(())
}
