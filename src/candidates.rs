//! Candidate build index: product → version → latest build folder.
//!
//! Release records carry no build folder in their URL, so their metadata is
//! looked up in the newest `buildN/` folder of the matching
//! `<version>-candidates/` directory. The index is filled by listing the
//! archive once per product.

use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::archive::Archive;
use crate::http::{ArchiveClient, ListingError};

const VERSION_FOLDER_SUFFIX: &str = "-candidates/";

/// Outcome of one product scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub versions: usize,
    pub indexed: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct CandidateIndex {
    scanned: Mutex<HashSet<String>>,
    latest: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl CandidateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scanned(&self, product: &str) -> bool {
        lock(&self.scanned).contains(product)
    }

    /// Populate the index for `product`.
    ///
    /// Returns `Ok(None)` when the product was already scanned. The product
    /// is marked before the first request, so a failed top-level listing is
    /// not retried during the run. Failures on single versions are logged
    /// and leave only that version out.
    pub async fn scan(
        &self,
        client: &ArchiveClient,
        archive: &Archive,
        product: &str,
        parallel: usize,
    ) -> Result<Option<ScanReport>, ListingError> {
        if !lock(&self.scanned).insert(product.to_string()) {
            return Ok(None);
        }

        tracing::info!("Scan '{}' candidates to get their latest build folder...", product);
        let listing = client.fetch_listing(&archive.candidates_url(product)).await?;

        let versions: Vec<&str> = listing
            .prefixes
            .iter()
            .filter_map(|prefix| prefix.strip_suffix(VERSION_FOLDER_SUFFIX))
            .collect();

        let mut report = ScanReport {
            versions: versions.len(),
            ..ScanReport::default()
        };

        for chunk in versions.chunks(parallel.max(1)) {
            let lookups = chunk.iter().map(|version| async move {
                let url = archive.version_candidates_url(product, version);
                (*version, client.fetch_listing(&url).await)
            });

            for (version, outcome) in join_all(lookups).await {
                match outcome {
                    Ok(listing) => {
                        let latest = listing
                            .prefixes
                            .iter()
                            .map(|p| p.trim_end_matches('/'))
                            .filter(|p| !p.is_empty())
                            .max();
                        if let Some(folder) = latest {
                            self.record(product, version, folder);
                            report.indexed += 1;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Skipping candidates of {} {}: {}", product, version, e);
                        report.failed += 1;
                    }
                }
            }
        }

        tracing::info!(
            "Scan of '{}' done: {} versions, {} indexed, {} failed",
            product,
            report.versions,
            report.indexed,
            report.failed
        );
        Ok(Some(report))
    }

    /// Latest build folder name (e.g. `build3`) for a product version.
    pub fn latest_build(&self, product: &str, version: &str) -> Option<String> {
        lock(&self.latest)
            .get(product)
            .and_then(|versions| versions.get(version))
            .cloned()
    }

    /// All indexed versions of `product` with their latest build folder.
    pub fn versions(&self, product: &str) -> Vec<(String, String)> {
        lock(&self.latest)
            .get(product)
            .map(|versions| {
                versions
                    .iter()
                    .map(|(v, f)| (v.clone(), f.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn record(&self, product: &str, version: &str, folder: &str) {
        lock(&self.latest)
            .entry(product.to_string())
            .or_default()
            .insert(version.to_string(), folder.to_string());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpRequest, HttpResponse, RetryPolicy, TransportError};
    use crate::traits::Transport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Listings {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Listings {
        async fn get(
            &self,
            request: &HttpRequest,
            _timeout: Duration,
        ) -> Result<HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = match request.url.as_str() {
                "https://archive.test/pub/firefox/candidates/" => {
                    r#"{"prefixes": ["57.0-candidates/", "58.0b3-candidates/", "59.0-candidates/", "archived/"], "files": []}"#
                }
                "https://archive.test/pub/firefox/candidates/57.0-candidates/" => {
                    r#"{"prefixes": ["build1/", "build4/", "build2/"], "files": []}"#
                }
                "https://archive.test/pub/firefox/candidates/58.0b3-candidates/" => {
                    r#"{"prefixes": ["build1/"], "files": [{"name": "KEY"}]}"#
                }
                "https://archive.test/pub/firefox/candidates/59.0-candidates/" => r#"{"files": []}"#,
                _ => return Ok(HttpResponse::not_found()),
            };
            Ok(HttpResponse::ok(body))
        }
    }

    fn setup() -> (Arc<Listings>, ArchiveClient, Archive) {
        let transport = Arc::new(Listings {
            calls: AtomicUsize::new(0),
        });
        let client = ArchiveClient::new(
            transport.clone(),
            Duration::from_secs(5),
            RetryPolicy::default(),
        );
        (transport, client, Archive::new("https://archive.test"))
    }

    #[tokio::test]
    async fn scan_indexes_latest_build_per_version() {
        let (_, client, archive) = setup();
        let index = CandidateIndex::new();
        let report = index
            .scan(&client, &archive, "firefox", 2)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.versions, 3);
        assert_eq!(report.indexed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(index.latest_build("firefox", "57.0").as_deref(), Some("build4"));
        assert_eq!(index.latest_build("firefox", "58.0b3").as_deref(), Some("build1"));
        assert_eq!(index.latest_build("firefox", "59.0"), None);
    }

    #[tokio::test]
    async fn second_scan_is_a_no_op() {
        let (transport, client, archive) = setup();
        let index = CandidateIndex::new();
        index.scan(&client, &archive, "firefox", 8).await.unwrap();
        let calls = transport.calls.load(Ordering::SeqCst);
        let before = index.versions("firefox");

        assert!(index.scan(&client, &archive, "firefox", 8).await.unwrap().is_none());
        assert_eq!(transport.calls.load(Ordering::SeqCst), calls);
        assert_eq!(index.versions("firefox"), before);
    }

    #[tokio::test]
    async fn failed_top_level_listing_is_an_error() {
        let (_, client, archive) = setup();
        let index = CandidateIndex::new();
        let err = index
            .scan(&client, &archive, "thunderbird", 8)
            .await
            .unwrap_err();
        assert!(err.url.ends_with("/pub/thunderbird/candidates/"));
        assert!(index.is_scanned("thunderbird"));
        assert!(index.versions("thunderbird").is_empty());
    }
}
