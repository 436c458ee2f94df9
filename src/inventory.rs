//! Inventory row source.
//!
//! The storage inventory is a headerless CSV export with one row per object:
//! `bucket, key, size, lastModifiedDate, checksum`. Rows are read lazily so
//! multi-gigabyte inventories never sit in memory at once.
//!
//! The CSV reader is synchronous. [`spawn_reader`] runs it on a blocking
//! thread and hands entries to the async pipeline over a bounded channel.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::io::Read;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Timestamp layout used by the inventory export (`2020-01-01T00:00:00.000Z`).
const INVENTORY_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Timestamp layout written into records.
pub const RECORD_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One row of the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub bucket: String,
    /// Storage path, e.g. `pub/firefox/releases/57.0/win64/en-US/firefox-57.0.zip`.
    pub key: String,
    /// Decimal text, sometimes in scientific notation (`2E+10`).
    pub size: String,
    pub last_modified: String,
    pub checksum: String,
}

impl InventoryEntry {
    pub fn new(key: impl Into<String>, size: impl Into<String>, last_modified: impl Into<String>) -> Self {
        Self {
            bucket: "net-mozaws-prod-delivery-archive".to_string(),
            key: key.into(),
            size: size.into(),
            last_modified: last_modified.into(),
            checksum: String::new(),
        }
    }

    /// Size in bytes. Parsed as a float first so exponent notation works.
    pub fn size_bytes(&self) -> Result<u64> {
        let value: f64 = self
            .size
            .trim()
            .parse()
            .with_context(|| format!("invalid size '{}' for '{}'", self.size, self.key))?;
        if !value.is_finite() || value < 0.0 {
            anyhow::bail!("invalid size '{}' for '{}'", self.size, self.key);
        }
        Ok(value.trunc() as u64)
    }

    /// Last-modified date re-rendered without fractional seconds.
    pub fn last_modified_date(&self) -> Result<String> {
        let parsed = NaiveDateTime::parse_from_str(self.last_modified.trim(), INVENTORY_DATE_FORMAT)
            .with_context(|| {
                format!(
                    "invalid last modified date '{}' for '{}'",
                    self.last_modified, self.key
                )
            })?;
        Ok(parsed.format(RECORD_DATE_FORMAT).to_string())
    }
}

/// Lazily read inventory rows from a CSV source.
///
/// Rows with the wrong number of columns or broken encoding are skipped with
/// a warning; they never end the iteration.
pub fn read_inventory<R: Read>(reader: R) -> impl Iterator<Item = InventoryEntry> {
    let csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    csv_reader
        .into_records()
        .filter_map(|row| match row {
            Ok(row) if row.len() == 5 => Some(InventoryEntry {
                bucket: row[0].to_string(),
                key: row[1].to_string(),
                size: row[2].to_string(),
                last_modified: row[3].to_string(),
                checksum: row[4].to_string(),
            }),
            Ok(row) => {
                tracing::warn!(
                    "Skipping inventory row with {} columns: {:?}",
                    row.len(),
                    row
                );
                None
            }
            Err(e) => {
                tracing::warn!("Skipping unreadable inventory row: {}", e);
                None
            }
        })
}

/// Read the inventory on a blocking thread and stream entries over a channel.
///
/// The channel is bounded so a slow pipeline applies backpressure to the
/// reader. The returned handle resolves once the input is exhausted or the
/// receiver has been dropped.
pub fn spawn_reader<R>(reader: R, capacity: usize) -> (mpsc::Receiver<InventoryEntry>, JoinHandle<u64>)
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::task::spawn_blocking(move || {
        let mut sent = 0u64;
        for entry in read_inventory(reader) {
            if tx.blocking_send(entry).is_err() {
                break;
            }
            sent += 1;
        }
        sent
    });
    (rx, handle)
}
