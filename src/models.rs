//! Core data models used throughout the enrichment pipeline.
//!
//! A [`BuildRecord`] starts life as a skeleton built from an archive URL,
//! gets its `build` section filled from the [`Metadata`] published next to
//! the artifact, and is finally emitted wrapped in an [`OutputRecord`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Product and branch an artifact was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub product: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<String>,
}

/// What the artifact is for: channel, version, platform and locale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub channel: String,
    pub version: String,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    pub locale: String,
}

/// Where the artifact lives and how big it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// Build provenance, only present once metadata has been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_stamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_number: Option<u64>,
}

/// One build artifact and its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: String,
    pub source: SourceInfo,
    pub target: TargetInfo,
    pub download: DownloadInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildInfo>,
}

impl BuildRecord {
    /// Which metadata lookup strategy applies to this record.
    pub fn classification(&self) -> Classification {
        Classification::of(self)
    }
}

/// The three build lineages, each with its own metadata lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    Nightly,
    ReleaseCandidate,
    Release,
}

impl Classification {
    /// Nightly wins over the version check: nightly versions never carry `rc`.
    pub fn of(record: &BuildRecord) -> Self {
        if record.target.channel.contains("nightly") {
            Classification::Nightly
        } else if record.target.version.contains("rc") {
            Classification::ReleaseCandidate
        } else {
            Classification::Release
        }
    }
}

/// Build metadata document as published on the archive.
///
/// Kept as a raw JSON object so unknown keys survive a trip through the
/// persisted cache. Accessors pick out the fields the merger cares about.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(pub Map<String, Value>);

impl Metadata {
    /// Wrap a decoded JSON document. Anything but an object is rejected.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect(),
        )
    }

    /// `buildid`, which some documents publish as a number.
    pub fn build_id(&self) -> Option<String> {
        self.string_field("buildid")
    }

    pub fn source_repo(&self) -> Option<String> {
        self.string_field("moz_source_repo")
    }

    pub fn source_stamp(&self) -> Option<String> {
        self.string_field("moz_source_stamp")
    }

    pub fn build_number(&self) -> Option<u64> {
        match self.0.get("buildnumber")? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn with_build_number(mut self, number: u64) -> Self {
        self.0.insert("buildnumber".to_string(), Value::from(number));
        self
    }

    fn string_field(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Envelope handed to the record sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub data: BuildRecord,
}
