//! Archive URL conventions.
//!
//! Everything that knows how build artifacts are laid out on the archive
//! lives here: building directory URLs, rewriting localized URLs to the
//! reference locale, recognizing build artifacts and metadata files, and
//! turning an artifact URL into a skeleton [`BuildRecord`].
//!
//! # Layout
//!
//! ```text
//! pub/<product>/nightly/YYYY/MM/YYYY-MM-DD-HH-MM-SS-<tree>[-l10n]/<file>
//! pub/<product>/candidates/<version>-candidates/build<N>/<platform>/<locale>/<file>
//! pub/<product>/releases/<version>/<platform>/<locale>/<file>
//! ```
//!
//! Fennec lives under the `mobile` directory.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

use crate::models::{BuildRecord, DownloadInfo, SourceInfo, TargetInfo};

pub const DEFAULT_ARCHIVE_URL: &str = "https://archive.mozilla.org/";

/// Locale whose metadata is shared by every localized repack.
pub const REFERENCE_LOCALE: &str = "en-US";

/// Product directories known to the pipeline.
pub const ALL_PRODUCTS: &[&str] = &["firefox", "thunderbird", "mobile", "devedition"];

/// Repository implied by the single-line legacy nightly text format.
pub const DEFAULT_SOURCE_REPO: &str = "http://hg.mozilla.org/mozilla-central";

static FILE_EXTENSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(installer\.exe|installer\.tar\.gz|tar\.gz|tar\.bz2|zip|dmg|apk|exe|msi|pkg)$")
        .unwrap()
});

static FILE_LOCALE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.([a-zA-Z]{2,3}(?:-[a-zA-Z]+)*)\.((?:win|mac|linux|android)[a-zA-Z0-9_-]*)\.")
        .unwrap()
});

static NIGHTLY_FOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}-\d{2}(?:-\d{2}-\d{2})?)-(.+?)(-l10n)?$").unwrap()
});

static NIGHTLY_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z]+-(\d+(?:\.\d+)+(?:[ab]\d+)?(?:pre)?)\.(multi|[a-zA-Z]{2,3}(?:-[a-zA-Z]+)*)\.([a-zA-Z0-9_-]+)\.",
    )
    .unwrap()
});

static BUILD_FOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^build(\d+)$").unwrap());

static BUILD_SEGMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/build(\d+)/").unwrap());

static TRAILING_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)/?$").unwrap());

static REPACK_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)-(eme-free|sha1)").unwrap());

/// Path fragments that never denote a build artifact.
const NON_BUILD_MARKERS: &[&str] = &[
    "/source/",
    "-sdk",
    ".sdk.",
    "tests",
    "crashreporter",
    "symbols",
    "checksums",
    "langpack",
    "/partner-repacks/",
    "/update/",
    "/jsshell",
    "/mar-tools/",
    "/logs/",
    "stub",
    ".partial.",
    ".complete.",
];

/// Why a URL could not be turned into a record skeleton.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SkeletonError {
    #[error("'{0}' is not under the archive root")]
    ForeignUrl(String),
    #[error("'{0}' does not follow a known build layout")]
    UnknownLayout(String),
    #[error("cannot parse nightly file name in '{0}'")]
    NightlyFileName(String),
}

/// URL builder rooted at a configurable archive location.
#[derive(Debug, Clone)]
pub struct Archive {
    root: String,
}

impl Default for Archive {
    fn default() -> Self {
        Self::new(DEFAULT_ARCHIVE_URL)
    }
}

impl Archive {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        if !root.ends_with('/') {
            root.push('/');
        }
        Self { root }
    }

    /// Public URL of an inventory key. Inventory keys encode spaces as `+`.
    pub fn object_url(&self, key: &str) -> String {
        format!("{}{}", self.root, key.replace('+', " "))
    }

    /// `pub/<product>/candidates/`
    pub fn candidates_url(&self, product: &str) -> String {
        format!("{}pub/{}/candidates/", self.root, product_dir(product))
    }

    /// `pub/<product>/candidates/<version>-candidates/`
    pub fn version_candidates_url(&self, product: &str, version: &str) -> String {
        format!("{}{}-candidates/", self.candidates_url(product), version)
    }

    /// `pub/<product>/candidates/<version>-candidates/<build>/<platform>/<locale>/`
    pub fn candidate_build_url(
        &self,
        product: &str,
        version: &str,
        build_folder: &str,
        platform: &str,
        locale: &str,
    ) -> String {
        format!(
            "{}{}/{}/{}/",
            self.version_candidates_url(product, version),
            build_folder.trim_matches('/'),
            platform,
            locale
        )
    }

    /// Build a skeleton record from an artifact URL.
    ///
    /// Only layout-derived fields are filled; size, date and the `build`
    /// section come later.
    pub fn record_from_url(&self, url: &str) -> Result<BuildRecord, SkeletonError> {
        let path = url
            .strip_prefix(self.root.as_str())
            .ok_or_else(|| SkeletonError::ForeignUrl(url.to_string()))?;
        let parts: Vec<&str> = path.split('/').collect();
        let unknown = || SkeletonError::UnknownLayout(url.to_string());

        if parts.len() < 4 || parts[0] != "pub" {
            return Err(unknown());
        }
        let product = canonical_product(parts[1]).to_string();
        let file_name = *parts.last().ok_or_else(unknown)?;

        let (channel, version, platform, locale, tree, id) = match parts[2] {
            "nightly" if parts.len() == 7 => {
                let caps = NIGHTLY_FOLDER.captures(parts[5]).ok_or_else(unknown)?;
                let timestamp = caps[1].to_string();
                let tree = caps[2].to_string();
                let file = NIGHTLY_FILE
                    .captures(file_name)
                    .ok_or_else(|| SkeletonError::NightlyFileName(url.to_string()))?;
                let version = file[1].to_string();
                let locale = file[2].to_string();
                let platform = file[3].to_string();
                let id = record_id(&[&product, "nightly", &timestamp, &version, &platform, &locale]);
                ("nightly".to_string(), version, platform, locale, Some(tree), id)
            }
            "candidates" if parts.len() == 8 => {
                let base_version = parts[3]
                    .strip_suffix("-candidates")
                    .ok_or_else(unknown)?;
                let build = BUILD_FOLDER.captures(parts[4]).ok_or_else(unknown)?;
                let version = format!("{}rc{}", base_version, &build[1]);
                let channel = channel_for(&product, base_version);
                let (platform, locale) = (parts[5].to_string(), parts[6].to_string());
                let id = record_id(&[&product, &channel, &version, &platform, &locale]);
                (channel, version, platform, locale, None, id)
            }
            "releases" if parts.len() == 7 => {
                let version = parts[3].to_string();
                let channel = channel_for(&product, &version);
                let (platform, locale) = (parts[4].to_string(), parts[5].to_string());
                let id = record_id(&[&product, &channel, &version, &platform, &locale]);
                (channel, version, platform, locale, None, id)
            }
            _ => return Err(unknown()),
        };

        Ok(BuildRecord {
            id,
            source: SourceInfo { product, tree },
            target: TargetInfo {
                os: os_for(&platform),
                channel,
                version,
                platform,
                locale,
            },
            download: DownloadInfo {
                url: url.to_string(),
                mimetype: mimetype_for(file_name).map(str::to_string),
                size: None,
                date: None,
            },
            build: None,
        })
    }
}

/// Archive directory name for a product.
pub fn product_dir(product: &str) -> &str {
    match product {
        "fennec" => "mobile",
        other => other,
    }
}

/// Product name used in records and in the candidate index.
pub fn canonical_product(dir: &str) -> &str {
    match dir {
        "mobile" => "fennec",
        other => other,
    }
}

/// Product prefix of metadata file names. Developer Edition ships Firefox builds.
pub fn metadata_file_product(product: &str) -> &str {
    match product {
        "devedition" => "firefox",
        other => other,
    }
}

/// Product directory of an inventory key (`pub/<product>/...`).
pub fn product_of_key(key: &str) -> Option<&str> {
    key.split('/').nth(1).filter(|p| !p.is_empty())
}

/// Whether `url` points at an installable build of `product`.
pub fn is_build_url(product: &str, url: &str) -> bool {
    let marker = format!("/pub/{}/", product);
    if !url.contains(&marker) {
        return false;
    }
    if !["/nightly/", "/candidates/", "/releases/"]
        .iter()
        .any(|family| url.contains(family))
    {
        return false;
    }
    if !FILE_EXTENSION.is_match(url) {
        return false;
    }
    let lowered = url.to_lowercase();
    !NON_BUILD_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Replace the artifact extension (`.zip`, `.installer.exe`, ...) with `ext`.
///
/// Returns `None` when the URL has no known extension.
pub fn replace_extension(url: &str, ext: &str) -> Option<String> {
    let m = FILE_EXTENSION.find(url)?;
    Some(format!("{}.{}", &url[..m.start()], ext))
}

/// Replace the last path segment of `url` with `file_name`.
pub fn sibling_url(url: &str, file_name: &str) -> String {
    match url.rfind('/') {
        Some(pos) => format!("{}{}", &url[..=pos], file_name),
        None => file_name.to_string(),
    }
}

/// Rewrite a nightly URL to its reference-locale equivalent.
///
/// Localized nightlies live in `-l10n` folders and carry the locale in the
/// file name, e.g. `.../2017-10-01-10-01-02-mozilla-central-l10n/firefox-58.0a1.fr.win64.zip`.
pub fn localize_nightly_url(url: &str) -> String {
    let url = url.replace("-l10n/", "/");
    localize_file_name(&url)
}

/// Rewrite a candidates URL to its reference-locale equivalent.
///
/// The locale is the directory right above the file name; Fennec file names
/// carry it too.
pub fn localize_release_candidate_url(url: &str) -> String {
    let mut parts: Vec<&str> = url.split('/').collect();
    let n = parts.len();
    if n >= 3 && url.contains("-candidates/") {
        parts[n - 2] = REFERENCE_LOCALE;
    }
    localize_file_name(&parts.join("/"))
}

fn localize_file_name(url: &str) -> String {
    let (dir, file) = match url.rfind('/') {
        Some(pos) => url.split_at(pos + 1),
        None => ("", url),
    };
    let file = FILE_LOCALE.replace(file, format!(".{}.${{2}}.", REFERENCE_LOCALE));
    format!("{}{}", dir, file)
}

/// Build number from a `/build<N>/` segment of a candidates URL.
pub fn build_number_from_url(url: &str) -> Option<u64> {
    BUILD_SEGMENT.captures(url)?.get(1)?.as_str().parse().ok()
}

/// Build number from a build folder name (`build3/` → 3).
pub fn build_number_from_folder(folder: &str) -> Option<u64> {
    TRAILING_DIGITS.captures(folder)?.get(1)?.as_str().parse().ok()
}

/// Repacks (EME-free, SHA-1) share metadata with the original platform.
pub fn strip_repack_suffix(platform: &str) -> String {
    REPACK_SUFFIX.replace_all(platform, "").into_owned()
}

/// Whether `file_name` is the build metadata document of `product`/`version`
/// inside a candidates platform folder.
///
/// Matches `firefox-57.0.json` and `fennec-57.0.en-US.android-arm.json`, but
/// not companions such as `firefox-57.0.mozinfo.json`.
pub fn is_release_build_metadata(product: &str, version: &str, file_name: &str) -> bool {
    let pattern = format!(
        r"^{}-{}(\.[a-zA-Z]{{2,3}}(?:-[a-zA-Z]+)*\.[a-zA-Z0-9_-]+)?\.json$",
        regex::escape(metadata_file_product(product)),
        regex::escape(version)
    );
    Regex::new(&pattern)
        .map(|re| re.is_match(file_name))
        .unwrap_or(false)
}

fn channel_for(product: &str, version: &str) -> String {
    let channel = if product == "devedition" {
        "aurora"
    } else if version.contains("esr") {
        "esr"
    } else if version.contains('b') {
        "beta"
    } else if version.contains('a') {
        "aurora"
    } else {
        "release"
    };
    channel.to_string()
}

fn os_for(platform: &str) -> Option<String> {
    ["win", "mac", "linux", "android"]
        .iter()
        .find(|os| platform.starts_with(*os))
        .map(|os| os.to_string())
}

fn mimetype_for(file_name: &str) -> Option<&'static str> {
    let ext = FILE_EXTENSION.captures(file_name)?.get(1)?.as_str();
    Some(match ext {
        "zip" => "application/zip",
        "tar.gz" | "installer.tar.gz" => "application/x-gzip",
        "tar.bz2" => "application/x-bzip2",
        "dmg" => "application/x-apple-diskimage",
        "apk" => "application/vnd.android.package-archive",
        "msi" => "application/x-msi",
        "pkg" => "application/x-newton-compatible-pkg",
        _ => "application/msdos-windows",
    })
}

fn record_id(parts: &[&str]) -> String {
    parts.join("_").to_lowercase().replace('.', "-")
}
