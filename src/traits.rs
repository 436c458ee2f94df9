//! Extension seams of the pipeline.
//!
//! Three traits decouple the enrichment core from the outside world:
//!
//! - [`Transport`] issues raw HTTP GETs. The production implementation is
//!   [`ReqwestTransport`](crate::http::ReqwestTransport); tests plug in a
//!   scripted in-memory transport.
//! - [`MetadataResolver`] is the shared contract of the three metadata
//!   lookup strategies (nightly, release candidate, release).
//! - [`RecordSink`] receives finished records in emission order.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌────────────┐
//! │  Pipeline    │──▶│ MetadataResolver │──▶│ Transport  │
//! │ (batches)    │   │ nightly/rc/rel.  │   │ (reqwest)  │
//! └──────┬───────┘   └──────────────────┘   └────────────┘
//!        ▼
//! ┌──────────────┐
//! │ RecordSink   │
//! └──────────────┘
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::io::Write;
use std::time::Duration;

use crate::http::{HttpRequest, HttpResponse, TransportError};
use crate::metadata::ResolveError;
use crate::models::{BuildRecord, Metadata, OutputRecord};

// ═══════════════════════════════════════════════════════════════════════
// Transport
// ═══════════════════════════════════════════════════════════════════════

/// Raw HTTP GET.
///
/// Implementations perform exactly one request per call. Retries, the
/// per-attempt deadline and body decoding are layered on top by
/// [`ArchiveClient`](crate::http::ArchiveClient).
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use buildhub_records::http::{HttpRequest, HttpResponse, TransportError};
/// use buildhub_records::traits::Transport;
/// use std::time::Duration;
///
/// struct Offline;
///
/// #[async_trait]
/// impl Transport for Offline {
///     async fn get(&self, request: &HttpRequest, _timeout: Duration) -> Result<HttpResponse, TransportError> {
///         Err(TransportError::connect(format!("offline: {}", request.url)))
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET. `timeout` bounds the whole exchange; implementations
    /// report an expired deadline as [`TransportError::timeout`].
    async fn get(
        &self,
        request: &HttpRequest,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError>;
}

// ═══════════════════════════════════════════════════════════════════════
// MetadataResolver
// ═══════════════════════════════════════════════════════════════════════

/// One metadata lookup strategy.
///
/// `Ok(None)` means the metadata is known to be absent (and has been
/// negatively cached). `Err` means the lookup could not be completed this
/// time (timeouts, missing candidate index data) and was not persisted.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    /// Short strategy name used in logs.
    fn name(&self) -> &str;

    /// Resolve the metadata document for `record`.
    async fn resolve(&self, record: &BuildRecord) -> Result<Option<Metadata>, ResolveError>;
}

// ═══════════════════════════════════════════════════════════════════════
// RecordSink
// ═══════════════════════════════════════════════════════════════════════

/// Consumer of finished records, called in emission order.
pub trait RecordSink {
    fn emit(&mut self, record: OutputRecord) -> Result<()>;
}

/// Collects records in memory.
impl RecordSink for Vec<OutputRecord> {
    fn emit(&mut self, record: OutputRecord) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

/// Writes one JSON document per line.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RecordSink for JsonLinesSink<W> {
    fn emit(&mut self, record: OutputRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DownloadInfo, SourceInfo, TargetInfo};

    fn output(id: &str) -> OutputRecord {
        OutputRecord {
            data: BuildRecord {
                id: id.to_string(),
                source: SourceInfo {
                    product: "firefox".to_string(),
                    tree: None,
                },
                target: TargetInfo {
                    channel: "release".to_string(),
                    version: "57.0".to_string(),
                    platform: "win64".to_string(),
                    os: Some("win".to_string()),
                    locale: "en-US".to_string(),
                },
                download: DownloadInfo {
                    url: "https://archive.test/firefox-57.0.zip".to_string(),
                    mimetype: None,
                    size: Some(1),
                    date: None,
                },
                build: None,
            },
        }
    }

    #[test]
    fn json_lines_sink_writes_one_object_per_line() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.emit(output("a")).unwrap();
        sink.emit(output("b")).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["data"]["id"], "a");
    }
}
