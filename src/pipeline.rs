//! Batch orchestration.
//!
//! Drives the full enrichment flow:
//!
//! ```text
//! inventory rows → folder groups → dedup → skeleton records
//!     → batches of `parallel_requests` → concurrent metadata lookups
//!     → merge → validate → sink
//! ```
//!
//! Batches run strictly one after the other; inside a batch every record's
//! lookup runs concurrently and results are paired back by position, so the
//! output order always matches the input order. The candidate index for a
//! product is built lazily, the first time one of its keys shows up.

use anyhow::{Context, Result};
use futures::future::join_all;
use futures::{Stream, StreamExt};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive::{canonical_product, is_build_url, product_of_key, Archive};
use crate::cache::MetadataCache;
use crate::candidates::{CandidateIndex, ScanReport};
use crate::config::Config;
use crate::grouping::{deduplicate, FolderGrouper};
use crate::http::{ArchiveClient, ListingError};
use crate::inventory::{spawn_reader, InventoryEntry};
use crate::merge::{check_record, merge_metadata, ValidationPolicy};
use crate::metadata::{MetadataFetcher, ResolveContext};
use crate::models::{BuildRecord, OutputRecord};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::stats::RunStats;
use crate::traits::{RecordSink, Transport};

/// Rows buffered between the CSV reader thread and the pipeline.
const READER_CHANNEL_CAPACITY: usize = 1024;

pub struct Pipeline {
    ctx: Arc<ResolveContext>,
    fetcher: MetadataFetcher,
    products: Vec<String>,
    parallel: usize,
    policy: ValidationPolicy,
    cache_path: PathBuf,
    progress: Box<dyn ProgressReporter>,
}

impl Pipeline {
    /// Build a pipeline and load the persisted metadata cache, if any.
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        let cache_path = config.cache.file_path();
        let cache = MetadataCache::load_or_default(&cache_path);
        tracing::debug!("Metadata cache: {}", cache_path.display());

        let ctx = Arc::new(ResolveContext {
            client: ArchiveClient::from_config(transport, &config.fetch),
            archive: Archive::new(config.fetch.archive_url.clone()),
            cache: Arc::new(cache),
            index: Arc::new(CandidateIndex::new()),
        });

        Self {
            fetcher: MetadataFetcher::new(ctx.clone()),
            ctx,
            products: config.pipeline.products.clone(),
            parallel: config.fetch.parallel_requests.max(1),
            policy: config.pipeline.validation,
            cache_path,
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_policy(mut self, policy: ValidationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.ctx.cache
    }

    pub fn index(&self) -> &CandidateIndex {
        &self.ctx.index
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Read a CSV inventory on a blocking thread and run it through the
    /// pipeline.
    pub async fn run_inventory<R>(&self, reader: R, sink: &mut dyn RecordSink) -> Result<RunStats>
    where
        R: Read + Send + 'static,
    {
        let (mut rx, reader_handle) = spawn_reader(reader, READER_CHANNEL_CAPACITY);
        let entries = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
        let stats = self.run(entries, sink).await?;

        let read = reader_handle.await.context("Inventory reader panicked")?;
        tracing::debug!("Inventory reader finished after {} rows", read);
        Ok(stats)
    }

    /// Enrich every entry of `entries` and hand the results to `sink`.
    ///
    /// The cache is persisted at the end of a clean run. A failure to
    /// persist is logged; it does not fail the run.
    pub async fn run<S>(&self, mut entries: S, sink: &mut dyn RecordSink) -> Result<RunStats>
    where
        S: Stream<Item = InventoryEntry> + Unpin,
    {
        let mut stats = RunStats::default();
        let mut grouper = FolderGrouper::new();
        let mut batch: Vec<BuildRecord> = Vec::with_capacity(self.parallel);

        while let Some(entry) = entries.next().await {
            stats.rows += 1;
            if let Some(group) = grouper.push(entry) {
                self.process_group(group, &mut batch, sink, &mut stats)
                    .await?;
            }
        }
        if let Some(group) = grouper.finish() {
            self.process_group(group, &mut batch, sink, &mut stats)
                .await?;
        }
        if !batch.is_empty() {
            self.process_batch(std::mem::take(&mut batch), sink, &mut stats)
                .await?;
        }

        if let Err(e) = self.persist_cache() {
            tracing::warn!("Could not persist metadata cache: {:#}", e);
        }
        Ok(stats)
    }

    /// Index the candidates of a product directory (`mobile` is indexed as
    /// `fennec`). No-op when already indexed.
    pub async fn scan(&self, product_dir: &str) -> Result<Option<ScanReport>, ListingError> {
        let product = canonical_product(product_dir);
        if !self.ctx.index.is_scanned(product) {
            self.progress.report(ProgressEvent::Scanning {
                product: product.to_string(),
            });
        }
        self.ctx
            .index
            .scan(&self.ctx.client, &self.ctx.archive, product, self.parallel)
            .await
    }

    pub fn persist_cache(&self) -> Result<()> {
        self.ctx.cache.persist(&self.cache_path)
    }

    async fn process_group(
        &self,
        group: Vec<InventoryEntry>,
        batch: &mut Vec<BuildRecord>,
        sink: &mut dyn RecordSink,
        stats: &mut RunStats,
    ) -> Result<()> {
        stats.groups += 1;
        let before = group.len();
        let group = deduplicate(group);
        stats.duplicates += (before - group.len()) as u64;

        for entry in group {
            let Some(record) = self.prepare(&entry).await else {
                stats.skipped += 1;
                continue;
            };
            batch.push(record);
            if batch.len() >= self.parallel {
                self.process_batch(std::mem::take(batch), sink, stats)
                    .await?;
            }
        }
        Ok(())
    }

    /// Turn an inventory entry into a skeleton record, or `None` when the
    /// key is not a build of an allowed product.
    async fn prepare(&self, entry: &InventoryEntry) -> Option<BuildRecord> {
        let product_dir = product_of_key(&entry.key)?;
        if !self.products.iter().any(|p| p == product_dir) {
            return None;
        }

        if let Err(e) = self.scan(product_dir).await {
            tracing::error!("Could not index candidates of '{}': {}", product_dir, e);
        }

        let url = self.ctx.archive.object_url(&entry.key);
        if !is_build_url(product_dir, &url) {
            return None;
        }

        let mut record = match self.ctx.archive.record_from_url(&url) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Skipping {}", e);
                return None;
            }
        };

        match entry.size_bytes() {
            Ok(size) => record.download.size = Some(size),
            Err(e) => tracing::warn!("{:#}", e),
        }
        match entry.last_modified_date() {
            Ok(date) => record.download.date = Some(date),
            Err(e) => tracing::warn!("{:#}", e),
        }
        Some(record)
    }

    async fn process_batch(
        &self,
        batch: Vec<BuildRecord>,
        sink: &mut dyn RecordSink,
        stats: &mut RunStats,
    ) -> Result<()> {
        stats.batches += 1;
        let size = batch.len();
        tracing::info!("Fetch metadata for {} releases...", size);

        let metadatas = join_all(batch.iter().map(|record| self.fetcher.fetch(record))).await;

        for (record, metadata) in batch.into_iter().zip(metadatas) {
            let record = merge_metadata(record, metadata.as_ref());
            if let Err(e) = check_record(&record) {
                match self.policy {
                    ValidationPolicy::Strict => {
                        tracing::warn!("{}", e);
                        stats.dropped += 1;
                        continue;
                    }
                    ValidationPolicy::Lenient => {
                        tracing::debug!("Emitting incomplete record: {}", e);
                        stats.incomplete += 1;
                    }
                }
            }
            sink.emit(OutputRecord { data: record })?;
            stats.emitted += 1;
        }

        self.progress.report(ProgressEvent::Batch {
            n: stats.batches,
            size,
            emitted: stats.emitted,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpRequest, HttpResponse, TransportError};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn get(
            &self,
            request: &HttpRequest,
            _timeout: Duration,
        ) -> Result<HttpResponse, TransportError> {
            Err(TransportError::connect(format!("offline: {}", request.url)))
        }
    }

    fn pipeline(dir: &std::path::Path) -> Pipeline {
        let mut config = Config::default();
        config.cache.folder = dir.to_path_buf();
        config.pipeline.products = vec!["firefox".to_string()];
        Pipeline::new(&config, Arc::new(Offline))
    }

    #[tokio::test]
    async fn non_build_keys_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let entries = vec![
            InventoryEntry::new("pub/thunderbird/releases/52.0/linux-i686/en-US/thunderbird-52.0.tar.bz2", "1", "2017-03-07T00:00:00.000Z"),
            InventoryEntry::new("pub/firefox/releases/57.0/win64/en-US/firefox-57.0.checksums", "1", "2017-11-14T00:00:00.000Z"),
            InventoryEntry::new("index.html", "1", "2017-11-14T00:00:00.000Z"),
        ];

        let mut sink: Vec<OutputRecord> = Vec::new();
        let stats = pipeline
            .run(futures::stream::iter(entries), &mut sink)
            .await
            .unwrap();

        assert!(sink.is_empty());
        assert_eq!(stats.rows, 3);
        assert_eq!(stats.skipped, 3);
        assert_eq!(stats.batches, 0);
    }

    #[tokio::test]
    async fn lenient_policy_emits_records_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path()).with_policy(ValidationPolicy::Lenient);
        let entries = vec![InventoryEntry::new(
            "pub/firefox/releases/57.0/win64/en-US/firefox-57.0.zip",
            "42",
            "2017-11-14T00:00:00.000Z",
        )];

        let mut sink: Vec<OutputRecord> = Vec::new();
        let stats = pipeline
            .run(futures::stream::iter(entries), &mut sink)
            .await
            .unwrap();

        assert_eq!(sink.len(), 1);
        assert!(sink[0].data.build.is_none());
        assert_eq!(sink[0].data.download.size, Some(42));
        assert_eq!(stats.incomplete, 1);
        assert!(pipeline.cache_path().exists());
    }
}
