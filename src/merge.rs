//! Merging metadata into records, and the minimum-field check applied before
//! a record is emitted.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inventory::RECORD_DATE_FORMAT;
use crate::models::{BuildInfo, BuildRecord, Metadata};

/// What to do with records that fail [`check_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    /// Drop and log.
    #[default]
    Strict,
    /// Emit with gaps.
    Lenient,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{id}: missing required field '{field}'")]
    MissingField { id: String, field: &'static str },
}

/// Fill the `build` section of `record` from `metadata`.
///
/// Without metadata, or without a build id in it, `build` stays empty.
pub fn merge_metadata(mut record: BuildRecord, metadata: Option<&Metadata>) -> BuildRecord {
    let Some(metadata) = metadata else {
        return record;
    };
    let Some(id) = metadata.build_id() else {
        return record;
    };

    record.build = Some(BuildInfo {
        date: build_date(&id),
        source_repo: metadata.source_repo(),
        source_stamp: metadata.source_stamp(),
        build_number: metadata.build_number(),
        id,
    });
    record
}

/// `20200101000000` → `2020-01-01T00:00:00Z`.
pub fn build_date(build_id: &str) -> Option<String> {
    let stamp = build_id.get(..14)?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| dt.format(RECORD_DATE_FORMAT).to_string())
}

pub fn check_record(record: &BuildRecord) -> Result<(), ValidationError> {
    let missing = |field: &'static str| ValidationError::MissingField {
        id: record.id.clone(),
        field,
    };

    if record.download.url.is_empty() {
        return Err(missing("download.url"));
    }
    if record.source.product.is_empty() {
        return Err(missing("source.product"));
    }
    if record.target.version.is_empty() {
        return Err(missing("target.version"));
    }
    if record.target.platform.is_empty() {
        return Err(missing("target.platform"));
    }
    if record.target.channel.is_empty() {
        return Err(missing("target.channel"));
    }
    match &record.build {
        Some(build) if !build.id.is_empty() => Ok(()),
        _ => Err(missing("build.id")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archive;
    use serde_json::json;

    fn skeleton() -> BuildRecord {
        Archive::default()
            .record_from_url(
                "https://archive.mozilla.org/pub/firefox/releases/57.0/win64/en-US/firefox-57.0.zip",
            )
            .unwrap()
    }

    #[test]
    fn merge_fills_build_section() {
        let metadata = Metadata::from_value(json!({
            "buildid": "20171024165158",
            "moz_source_repo": "https://hg.mozilla.org/releases/mozilla-release",
            "moz_source_stamp": "1ba4a2c3bd0e",
            "buildnumber": 4,
            "moz_update_channel": "release"
        }))
        .unwrap();

        let record = merge_metadata(skeleton(), Some(&metadata));
        let build = record.build.unwrap();
        assert_eq!(build.id, "20171024165158");
        assert_eq!(build.date.as_deref(), Some("2017-10-24T16:51:58Z"));
        assert_eq!(build.source_stamp.as_deref(), Some("1ba4a2c3bd0e"));
        assert_eq!(build.build_number, Some(4));
    }

    #[test]
    fn missing_metadata_leaves_build_empty() {
        assert!(merge_metadata(skeleton(), None).build.is_none());
        let empty = Metadata::default();
        assert!(merge_metadata(skeleton(), Some(&empty)).build.is_none());
    }

    #[test]
    fn odd_build_ids_get_no_date() {
        assert_eq!(build_date("2017"), None);
        assert_eq!(build_date("20171399000000"), None);
    }

    #[test]
    fn check_requires_build_id() {
        let record = skeleton();
        assert_eq!(
            check_record(&record),
            Err(ValidationError::MissingField {
                id: record.id.clone(),
                field: "build.id"
            })
        );

        let metadata = Metadata::from_pairs([("buildid", "20171024165158")]);
        assert!(check_record(&merge_metadata(record, Some(&metadata))).is_ok());
    }

    #[test]
    fn check_requires_download_url() {
        let metadata = Metadata::from_pairs([("buildid", "20171024165158")]);
        let mut record = merge_metadata(skeleton(), Some(&metadata));
        record.download.url.clear();
        assert!(matches!(
            check_record(&record),
            Err(ValidationError::MissingField {
                field: "download.url",
                ..
            })
        ));
    }

    #[test]
    fn policy_parses_lowercase() {
        let policy: ValidationPolicy = serde_json::from_str("\"lenient\"").unwrap();
        assert_eq!(policy, ValidationPolicy::Lenient);
        assert_eq!(ValidationPolicy::default(), ValidationPolicy::Strict);
    }
}
