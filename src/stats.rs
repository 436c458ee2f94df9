//! Run summary counters.
//!
//! Collected by the pipeline while it streams, printed to stderr at the end
//! of `run`. Also used by `cache stats` to describe the persisted cache.

use serde::Serialize;
use std::path::Path;

use crate::cache::{CacheKind, MetadataCache};
use crate::progress::format_number;

/// What happened to the rows of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Inventory rows consumed.
    pub rows: u64,
    /// Folder groups formed.
    pub groups: u64,
    /// Packaging variants collapsed by deduplication.
    pub duplicates: u64,
    /// Keys that are not builds of an allowed product, or have no known layout.
    pub skipped: u64,
    pub batches: u64,
    pub emitted: u64,
    /// Records that failed validation under the strict policy.
    pub dropped: u64,
    /// Emitted under the lenient policy despite failing validation.
    pub incomplete: u64,
}

impl RunStats {
    pub fn print_summary(&self) {
        eprintln!("Run summary");
        eprintln!("===========");
        eprintln!("  Rows read:          {}", format_number(self.rows));
        eprintln!("  Folder groups:      {}", format_number(self.groups));
        eprintln!("  Duplicates dropped: {}", format_number(self.duplicates));
        eprintln!("  Keys skipped:       {}", format_number(self.skipped));
        eprintln!("  Batches:            {}", format_number(self.batches));
        eprintln!("  Records emitted:    {}", format_number(self.emitted));
        if self.incomplete > 0 {
            eprintln!("    incomplete:       {}", format_number(self.incomplete));
        }
        eprintln!("  Records dropped:    {}", format_number(self.dropped));
    }
}

/// Print entry counts of the persisted cache at `path`.
pub fn print_cache_stats(path: &Path, cache: &MetadataCache) {
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    println!("Metadata cache");
    println!("==============");
    println!();
    println!("  File:  {}", path.display());
    println!("  Size:  {}", format_bytes(size));
    println!();
    println!("  {:<10} {:>10} {:>10}", "KIND", "PRESENT", "ABSENT");
    println!("  {}", "-".repeat(32));
    for kind in CacheKind::ALL {
        let counts = cache.counts(kind);
        println!(
            "  {:<10} {:>10} {:>10}",
            kind.as_str(),
            format_number(counts.present as u64),
            format_number(counts.absent as u64)
        );
    }
    println!();
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
