//! Folder grouping and same-folder deduplication.
//!
//! The inventory is sorted by key, so every file of a directory arrives as a
//! contiguous run. [`FolderGrouper`] cuts the stream at each directory change,
//! and [`deduplicate`] collapses packaging variants of the same build inside
//! one directory (Windows builds ship as both `.zip` and `.exe`, very old
//! Linux builds as both `.tar.gz` and `.installer.tar.gz`).

use std::collections::HashMap;

use crate::inventory::InventoryEntry;

/// Packaging suffixes stripped when computing a dedup identity, in order.
const PACKAGING_SUFFIXES: &[&str] = &[
    ".installer.exe",
    ".exe",
    ".installer.tar.gz",
    ".tar.gz",
    ".zip",
];

/// Directory component of a storage key (`""` for top-level keys).
pub fn folder_of(key: &str) -> &str {
    match key.rfind('/') {
        Some(pos) => &key[..pos],
        None => "",
    }
}

/// Incremental grouper: feed entries one by one, get a group back every
/// time the directory changes.
#[derive(Debug, Default)]
pub struct FolderGrouper {
    folder: Option<String>,
    entries: Vec<InventoryEntry>,
}

impl FolderGrouper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Returns the previous group when `entry` opens a new one.
    pub fn push(&mut self, entry: InventoryEntry) -> Option<Vec<InventoryEntry>> {
        let folder = folder_of(&entry.key);
        let flushed = match &self.folder {
            Some(current) if current == folder => None,
            Some(_) => Some(std::mem::take(&mut self.entries)),
            None => None,
        };
        if flushed.is_some() || self.folder.is_none() {
            self.folder = Some(folder.to_string());
        }
        self.entries.push(entry);
        flushed
    }

    /// Flush the trailing group at end of input.
    pub fn finish(self) -> Option<Vec<InventoryEntry>> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries)
        }
    }
}

/// Normalized identity shared by all packaging variants of one build.
pub fn dedup_identity(key: &str) -> String {
    let mut identity = key.to_lowercase().replace("+setup+", "-");
    for suffix in PACKAGING_SUFFIXES {
        if let Some(stripped) = identity.strip_suffix(suffix) {
            identity.truncate(stripped.len());
        }
    }
    identity
}

/// Keep one entry per identity: the longer raw key wins, ties go to the
/// lexicographically greater key (`.zip` over `.exe`).
///
/// Survivors keep the relative input order of the winning entries.
pub fn deduplicate(entries: Vec<InventoryEntry>) -> Vec<InventoryEntry> {
    let mut winners: HashMap<String, usize> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        let identity = dedup_identity(&entry.key);
        match winners.get(&identity) {
            Some(&current) if !beats(&entry.key, &entries[current].key) => {}
            _ => {
                winners.insert(identity, index);
            }
        }
    }

    let mut keep: Vec<usize> = winners.into_values().collect();
    keep.sort_unstable();

    let mut slots: Vec<Option<InventoryEntry>> = entries.into_iter().map(Some).collect();
    keep.into_iter().filter_map(|i| slots[i].take()).collect()
}

fn beats(candidate: &str, current: &str) -> bool {
    (candidate.len(), candidate) > (current.len(), current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str) -> InventoryEntry {
        InventoryEntry::new(key, "1", "2020-01-01T00:00:00.000Z")
    }

    fn keys(entries: &[InventoryEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.key.as_str()).collect()
    }

    #[test]
    fn folder_of_strips_file_name() {
        assert_eq!(folder_of("pub/firefox/a/b.zip"), "pub/firefox/a");
        assert_eq!(folder_of("favicon.ico"), "");
    }

    fn group_all(input: Vec<InventoryEntry>) -> Vec<Vec<InventoryEntry>> {
        let mut grouper = FolderGrouper::new();
        let mut groups: Vec<_> = input.into_iter().filter_map(|e| grouper.push(e)).collect();
        groups.extend(grouper.finish());
        groups
    }

    #[test]
    fn groups_follow_directory_changes() {
        let input = vec![
            entry("pub/a/1.zip"),
            entry("pub/a/2.zip"),
            entry("pub/b/1.zip"),
            entry("pub/c/1.zip"),
            entry("pub/c/2.zip"),
        ];
        let groups = group_all(input);
        assert_eq!(groups.len(), 3);
        assert_eq!(keys(&groups[0]), vec!["pub/a/1.zip", "pub/a/2.zip"]);
        assert_eq!(keys(&groups[1]), vec!["pub/b/1.zip"]);
        assert_eq!(keys(&groups[2]), vec!["pub/c/1.zip", "pub/c/2.zip"]);
    }

    #[test]
    fn empty_input_yields_no_group() {
        assert!(group_all(Vec::new()).is_empty());
    }

    #[test]
    fn trailing_group_is_flushed() {
        let mut grouper = FolderGrouper::new();
        assert!(grouper.push(entry("pub/a/1.zip")).is_none());
        assert!(grouper.push(entry("pub/a/2.zip")).is_none());
        let tail = grouper.finish().unwrap();
        assert_eq!(tail.len(), 2);
    }

    #[test]
    fn zip_wins_over_exe() {
        let group = vec![
            entry("pub/firefox/releases/100.0/win64/en-US/firefox-100.0.en-US.win64.exe"),
            entry("pub/firefox/releases/100.0/win64/en-US/firefox-100.0.en-US.win64.zip"),
        ];
        let kept = deduplicate(group);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].key.ends_with(".zip"));
    }

    #[test]
    fn zip_wins_regardless_of_arrival_order() {
        let group = vec![
            entry("pub/x/firefox-100.0.en-US.win64.zip"),
            entry("pub/x/firefox-100.0.en-US.win64.exe"),
        ];
        let kept = deduplicate(group);
        assert_eq!(keys(&kept), vec!["pub/x/firefox-100.0.en-US.win64.zip"]);
    }

    #[test]
    fn installer_tarball_wins_over_plain_tarball() {
        let group = vec![
            entry("pub/firefox/releases/1.5b2/linux-i686/en-US/firefox-1.5b2.installer.tar.gz"),
            entry("pub/firefox/releases/1.5b2/linux-i686/en-US/firefox-1.5b2.tar.gz"),
        ];
        let kept = deduplicate(group);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].key.ends_with(".installer.tar.gz"));
    }

    #[test]
    fn setup_marker_is_normalized() {
        assert_eq!(
            dedup_identity("pub/x/Firefox+Setup+57.0.exe"),
            dedup_identity("pub/x/firefox-57.0.zip")
        );
    }

    #[test]
    fn distinct_builds_survive_in_input_order() {
        let group = vec![
            entry("pub/x/firefox-58.0.tar.bz2"),
            entry("pub/x/firefox-58.0.dmg"),
            entry("pub/x/firefox-58.0.en-US.win32.zip"),
        ];
        let kept = deduplicate(group);
        assert_eq!(
            keys(&kept),
            vec![
                "pub/x/firefox-58.0.tar.bz2",
                "pub/x/firefox-58.0.dmg",
                "pub/x/firefox-58.0.en-US.win32.zip",
            ]
        );
    }
}
