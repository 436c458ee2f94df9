//! Metadata lookup strategies.
//!
//! Each build lineage publishes its metadata differently:
//!
//! | Lineage | Cache key | Where the metadata lives |
//! |---|---|---|
//! | nightly | en-US artifact URL | `<artifact>.json`, or a legacy `<artifact>.txt` |
//! | release candidate | en-US artifact URL | `<product>-<version>.json` next to the artifact (`.json` twin for Fennec) |
//! | release | en-US folder of the latest candidate build | first file of the folder listing matching the metadata name pattern |
//!
//! All three go through [`MetadataCache::resolve`], so a key is fetched at
//! most once per run even when several records of one batch share it, and
//! even when that fetch times out.
//! [`MetadataFetcher`] picks the strategy from the record's
//! [`Classification`] and turns every failure into "no metadata".

use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

use crate::archive::{
    build_number_from_folder, build_number_from_url, is_release_build_metadata,
    localize_nightly_url, localize_release_candidate_url, metadata_file_product,
    replace_extension, sibling_url, strip_repack_suffix, Archive, DEFAULT_SOURCE_REPO,
    REFERENCE_LOCALE,
};
use crate::cache::{CacheKind, MetadataCache, Unavailable};
use crate::candidates::CandidateIndex;
use crate::http::{ArchiveClient, FetchError, ListingError};
use crate::models::{BuildRecord, Classification, Metadata};
use crate::traits::MetadataResolver;

/// Why a lookup could not be completed. None of these are persisted.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Listing(#[from] ListingError),
    #[error(transparent)]
    Unavailable(#[from] Unavailable),
    #[error("{product} {version} is not listed in candidates")]
    NotIndexed { product: String, version: String },
}

impl ResolveError {
    /// True when the retry budget ran out, here or in an earlier lookup of
    /// the same key. The HTTP client has already logged those.
    pub fn is_timeout(&self) -> bool {
        match self {
            ResolveError::Fetch(e) => e.is_timeout(),
            ResolveError::Listing(e) => e.is_timeout(),
            ResolveError::Unavailable(_) => true,
            ResolveError::NotIndexed { .. } => false,
        }
    }
}

/// Everything the resolvers share for the lifetime of a run.
pub struct ResolveContext {
    pub client: ArchiveClient,
    pub archive: Archive,
    pub cache: Arc<MetadataCache>,
    pub index: Arc<CandidateIndex>,
}

// ============ Legacy nightly text formats ============

static TWO_LINE_LEGACY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A(\d+)\r?\n(http.+)/rev/(.+?)\r?\n?\z").unwrap());

static SINGLE_LINE_LEGACY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A(\d+) (.+?)\r?\n?\z").unwrap());

/// `<buildid>\n<repo>/rev/<revision>`, used by nightlies until 2011.
pub fn parse_two_line_legacy(text: &str) -> Option<Metadata> {
    let caps = TWO_LINE_LEGACY.captures(text)?;
    Some(Metadata::from_pairs([
        ("buildid", &caps[1]),
        ("moz_source_repo", &caps[2]),
        ("moz_source_stamp", &caps[3]),
    ]))
}

/// `<buildid> <revision>`, used by nightlies until 2010. The repository is
/// implied.
pub fn parse_single_line_legacy(text: &str) -> Option<Metadata> {
    let caps = SINGLE_LINE_LEGACY.captures(text)?;
    Some(Metadata::from_pairs([
        ("buildid", &caps[1]),
        ("moz_source_stamp", &caps[2]),
        ("moz_source_repo", DEFAULT_SOURCE_REPO),
    ]))
}

pub fn parse_legacy_text(text: &str) -> Option<Metadata> {
    parse_two_line_legacy(text).or_else(|| parse_single_line_legacy(text))
}

// ============ Nightly ============

pub struct NightlyResolver {
    ctx: Arc<ResolveContext>,
}

impl NightlyResolver {
    pub fn new(ctx: Arc<ResolveContext>) -> Self {
        Self { ctx }
    }

    async fn lookup(&self, url: &str) -> Result<Option<Metadata>, ResolveError> {
        let client = &self.ctx.client;

        if let Some(json_url) = replace_extension(url, "json") {
            match client.fetch_json(&json_url).await {
                Ok(value) => {
                    if let Some(metadata) = Metadata::from_value(value) {
                        return Ok(Some(metadata));
                    }
                }
                Err(e) if e.is_timeout() => return Err(e.into()),
                Err(e) => tracing::debug!("No JSON metadata: {}", e),
            }
        }

        if let Some(txt_url) = replace_extension(url, "txt") {
            match client.fetch_text(&txt_url).await {
                Ok(body) => {
                    if let Some(metadata) = parse_legacy_text(&body) {
                        return Ok(Some(metadata));
                    }
                }
                Err(e) if e.is_timeout() => return Err(e.into()),
                Err(e) => tracing::debug!("No legacy metadata: {}", e),
            }
        }

        tracing::warn!("Could not fetch metadata for '{}'", url);
        Ok(None)
    }
}

#[async_trait]
impl MetadataResolver for NightlyResolver {
    fn name(&self) -> &str {
        "nightly"
    }

    async fn resolve(&self, record: &BuildRecord) -> Result<Option<Metadata>, ResolveError> {
        let url = localize_nightly_url(&record.download.url);
        self.ctx
            .cache
            .resolve(CacheKind::Nightly, &url, || self.lookup(&url))
            .await
    }
}

// ============ Release candidate ============

pub struct CandidateResolver {
    ctx: Arc<ResolveContext>,
}

impl CandidateResolver {
    pub fn new(ctx: Arc<ResolveContext>) -> Self {
        Self { ctx }
    }

    /// Metadata document URL for a localized candidate artifact URL.
    pub fn metadata_url(record: &BuildRecord, rc_url: &str) -> Option<String> {
        let product = record.source.product.as_str();
        if product == "fennec" {
            return replace_extension(rc_url, "json");
        }
        let major = record
            .target
            .version
            .split("rc")
            .next()
            .unwrap_or(&record.target.version);
        Some(sibling_url(
            rc_url,
            &format!("{}-{}.json", metadata_file_product(product), major),
        ))
    }

    async fn lookup(
        &self,
        record: &BuildRecord,
        rc_url: &str,
    ) -> Result<Option<Metadata>, ResolveError> {
        let Some(metadata_url) = Self::metadata_url(record, rc_url) else {
            tracing::warn!("Could not derive metadata URL for '{}'", record.id);
            return Ok(None);
        };

        let value = match self.ctx.client.fetch_json(&metadata_url).await {
            Ok(value) => value,
            Err(e) if e.is_timeout() => return Err(e.into()),
            Err(e) => {
                // Very old candidates were published without metadata.
                tracing::warn!(
                    "Could not fetch metadata for '{}' from '{}': {}",
                    record.id,
                    metadata_url,
                    e
                );
                return Ok(None);
            }
        };

        let Some(mut metadata) = Metadata::from_value(value) else {
            tracing::warn!("Metadata at '{}' is not an object", metadata_url);
            return Ok(None);
        };
        if let Some(number) = build_number_from_url(&record.download.url) {
            metadata = metadata.with_build_number(number);
        }
        Ok(Some(metadata))
    }
}

#[async_trait]
impl MetadataResolver for CandidateResolver {
    fn name(&self) -> &str {
        "rc"
    }

    async fn resolve(&self, record: &BuildRecord) -> Result<Option<Metadata>, ResolveError> {
        let rc_url = localize_release_candidate_url(&record.download.url);
        self.ctx
            .cache
            .resolve(CacheKind::Rc, &rc_url, || self.lookup(record, &rc_url))
            .await
    }
}

// ============ Release ============

pub struct ReleaseResolver {
    ctx: Arc<ResolveContext>,
}

impl ReleaseResolver {
    pub fn new(ctx: Arc<ResolveContext>) -> Self {
        Self { ctx }
    }

    async fn lookup(
        &self,
        product: &str,
        version: &str,
        folder_url: &str,
        build_number: Option<u64>,
    ) -> Result<Option<Metadata>, ResolveError> {
        let client = &self.ctx.client;

        let listing = match client.fetch_listing(folder_url).await {
            Ok(listing) => listing,
            Err(e) if e.is_timeout() => return Err(e.into()),
            Err(e) => {
                // Some partial updates have no per-platform folder.
                tracing::warn!("{}", e);
                return Ok(None);
            }
        };

        let candidates = listing
            .files
            .iter()
            .filter(|f| is_release_build_metadata(product, version, &f.name));

        for file in candidates {
            let url = format!("{}{}", folder_url, file.name);
            match client.fetch_json(&url).await {
                Ok(value) => {
                    if let Some(metadata) = Metadata::from_value(value) {
                        return Ok(Some(match build_number {
                            Some(n) => metadata.with_build_number(n),
                            None => metadata,
                        }));
                    }
                }
                Err(e) if e.is_timeout() => return Err(e.into()),
                Err(e) => tracing::debug!("Skipping candidate metadata file: {}", e),
            }
        }

        tracing::warn!("Missing metadata for candidate {}", folder_url);
        Ok(None)
    }
}

#[async_trait]
impl MetadataResolver for ReleaseResolver {
    fn name(&self) -> &str {
        "release"
    }

    async fn resolve(&self, record: &BuildRecord) -> Result<Option<Metadata>, ResolveError> {
        let product = record.source.product.as_str();
        let version = record.target.version.as_str();

        let folder = self
            .ctx
            .index
            .latest_build(product, version)
            .ok_or_else(|| ResolveError::NotIndexed {
                product: product.to_string(),
                version: version.to_string(),
            })?;
        let build_number = build_number_from_folder(&folder);
        let platform = strip_repack_suffix(&record.target.platform);
        let folder_url = self.ctx.archive.candidate_build_url(
            product,
            version,
            &folder,
            &platform,
            REFERENCE_LOCALE,
        );

        self.ctx
            .cache
            .resolve(CacheKind::Release, &folder_url, || {
                self.lookup(product, version, &folder_url, build_number)
            })
            .await
    }
}

// ============ Dispatch ============

/// Routes each record to the resolver of its lineage.
pub struct MetadataFetcher {
    nightly: NightlyResolver,
    candidate: CandidateResolver,
    release: ReleaseResolver,
}

impl MetadataFetcher {
    pub fn new(ctx: Arc<ResolveContext>) -> Self {
        Self {
            nightly: NightlyResolver::new(ctx.clone()),
            candidate: CandidateResolver::new(ctx.clone()),
            release: ReleaseResolver::new(ctx),
        }
    }

    pub fn resolver_for(&self, classification: Classification) -> &dyn MetadataResolver {
        match classification {
            Classification::Nightly => &self.nightly,
            Classification::ReleaseCandidate => &self.candidate,
            Classification::Release => &self.release,
        }
    }

    /// Resolve metadata for `record`. Failures are logged and yield `None`.
    pub async fn fetch(&self, record: &BuildRecord) -> Option<Metadata> {
        let resolver = self.resolver_for(record.classification());
        match resolver.resolve(record).await {
            Ok(metadata) => metadata,
            Err(ResolveError::NotIndexed { product, version }) => {
                tracing::debug!(
                    "No candidates folder for {} {}, {} left without metadata",
                    product,
                    version,
                    record.id
                );
                None
            }
            Err(e) if e.is_timeout() => {
                tracing::debug!("{} left without metadata: {}", record.id, e);
                None
            }
            Err(e) => {
                tracing::warn!("{} lookup failed for '{}': {}", resolver.name(), record.id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_line_legacy_fixture() {
        let m = parse_legacy_text(
            "20110505030000\nhttp://hg.mozilla.org/mozilla-central/rev/abcdef123456",
        )
        .unwrap();
        assert_eq!(m.build_id().as_deref(), Some("20110505030000"));
        assert_eq!(
            m.source_repo().as_deref(),
            Some("http://hg.mozilla.org/mozilla-central")
        );
        assert_eq!(m.source_stamp().as_deref(), Some("abcdef123456"));
    }

    #[test]
    fn two_line_legacy_tolerates_trailing_newline() {
        let m = parse_two_line_legacy(
            "20110505030000\r\nhttp://hg.mozilla.org/mozilla-central/rev/abcdef123456\n",
        )
        .unwrap();
        assert_eq!(m.source_stamp().as_deref(), Some("abcdef123456"));
    }

    #[test]
    fn single_line_legacy_fixture() {
        let m = parse_legacy_text("20100704054020 8e1ba4d9d9f8\n").unwrap();
        assert_eq!(m.build_id().as_deref(), Some("20100704054020"));
        assert_eq!(m.source_stamp().as_deref(), Some("8e1ba4d9d9f8"));
        assert_eq!(m.source_repo().as_deref(), Some(DEFAULT_SOURCE_REPO));
    }

    #[test]
    fn exhausted_retries_count_as_timeouts() {
        let timeout = ResolveError::from(FetchError::Timeout {
            url: "https://archive.test/a.json".to_string(),
            attempts: 3,
        });
        assert!(timeout.is_timeout());

        let earlier = ResolveError::from(Unavailable {
            key: "https://archive.test/a.zip".to_string(),
            reason: timeout.to_string(),
        });
        assert!(earlier.is_timeout());

        let status = ResolveError::from(FetchError::Status {
            url: "https://archive.test/a.json".to_string(),
            status: 500,
        });
        assert!(!status.is_timeout());

        let not_indexed = ResolveError::NotIndexed {
            product: "firefox".to_string(),
            version: "1.0".to_string(),
        };
        assert!(!not_indexed.is_timeout());
    }

    #[test]
    fn unknown_text_is_rejected() {
        assert!(parse_legacy_text("<html>Not Found</html>").is_none());
        assert!(parse_legacy_text("").is_none());
        assert!(parse_two_line_legacy("20100704054020 8e1ba4d9d9f8").is_none());
    }

    fn rc_record(product: &str, version: &str, url: &str) -> BuildRecord {
        let mut record = Archive::default().record_from_url(url).unwrap();
        record.source.product = product.to_string();
        record.target.version = version.to_string();
        record
    }

    #[test]
    fn candidate_metadata_url_uses_major_version() {
        let url = "https://archive.mozilla.org/pub/firefox/candidates/57.0-candidates/build4/win64/en-US/firefox-57.0.zip";
        let record = rc_record("firefox", "57.0rc4", url);
        assert_eq!(
            CandidateResolver::metadata_url(&record, url).unwrap(),
            "https://archive.mozilla.org/pub/firefox/candidates/57.0-candidates/build4/win64/en-US/firefox-57.0.json"
        );
    }

    #[test]
    fn candidate_metadata_url_for_devedition_uses_firefox_prefix() {
        let url = "https://archive.mozilla.org/pub/devedition/candidates/58.0b3-candidates/build1/win64/en-US/firefox-58.0b3.zip";
        let record = rc_record("devedition", "58.0b3rc1", url);
        assert!(CandidateResolver::metadata_url(&record, url)
            .unwrap()
            .ends_with("/en-US/firefox-58.0b3.json"));
    }

    #[test]
    fn candidate_metadata_url_for_fennec_swaps_extension() {
        let url = "https://archive.mozilla.org/pub/mobile/candidates/57.0-candidates/build4/android-api-16/en-US/fennec-57.0.en-US.android-arm.apk";
        let record = rc_record("fennec", "57.0rc4", url);
        assert!(CandidateResolver::metadata_url(&record, url)
            .unwrap()
            .ends_with("/fennec-57.0.en-US.android-arm.json"));
    }
}
