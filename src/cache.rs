//! Metadata cache with single-flight lookups and on-disk persistence.
//!
//! Three independent maps (nightly, release candidate, release) map a
//! normalized URL to either a metadata document or an explicit "known
//! absent" marker. Each slot is a [`OnceCell`], so concurrent lookups of the
//! same key share one in-flight resolution:
//!
//! - the first caller runs the initializer, later callers await its result;
//! - `Ok(Some(_))` and `Ok(None)` are stored and persisted;
//! - `Err(_)` settles the slot as [`Unavailable`] for the rest of the run.
//!   Callers that were waiting on it get that error instead of starting
//!   their own fetch. Unavailable slots are never persisted, so the next
//!   run tries the key again.
//!
//! The snapshot is loaded once at startup and written back at the end of a
//! clean run through a temp file in the same directory, then renamed over
//! the previous file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::models::Metadata;

type Slot = Arc<OnceCell<Settled>>;

#[derive(Debug, Clone)]
enum Settled {
    Known(Option<Metadata>),
    Unavailable(String),
}

impl Settled {
    fn known(&self) -> Option<&Option<Metadata>> {
        match self {
            Settled::Known(value) => Some(value),
            Settled::Unavailable(_) => None,
        }
    }
}

/// A key whose lookup already failed earlier in this run.
#[derive(Debug, Clone, Error)]
#[error("lookup of {key} already failed in this run: {reason}")]
pub struct Unavailable {
    pub key: String,
    pub reason: String,
}

/// Which of the three maps a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Nightly,
    Rc,
    Release,
}

impl CacheKind {
    pub const ALL: [CacheKind; 3] = [CacheKind::Nightly, CacheKind::Rc, CacheKind::Release];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Nightly => "nightly",
            CacheKind::Rc => "rc",
            CacheKind::Release => "release",
        }
    }
}

/// Persisted form: `{"nightly": {...}, "rc": {...}, "release": {...}}`.
///
/// Absent markers serialize as `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    #[serde(default)]
    pub nightly: BTreeMap<String, Option<Metadata>>,
    #[serde(default)]
    pub rc: BTreeMap<String, Option<Metadata>>,
    #[serde(default)]
    pub release: BTreeMap<String, Option<Metadata>>,
}

impl CacheSnapshot {
    fn map(&self, kind: CacheKind) -> &BTreeMap<String, Option<Metadata>> {
        match kind {
            CacheKind::Nightly => &self.nightly,
            CacheKind::Rc => &self.rc,
            CacheKind::Release => &self.release,
        }
    }

    fn map_mut(&mut self, kind: CacheKind) -> &mut BTreeMap<String, Option<Metadata>> {
        match kind {
            CacheKind::Nightly => &mut self.nightly,
            CacheKind::Rc => &mut self.rc,
            CacheKind::Release => &mut self.release,
        }
    }
}

/// Per-kind entry counts, as reported by `cache stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheCounts {
    pub present: usize,
    pub absent: usize,
}

#[derive(Default)]
pub struct MetadataCache {
    nightly: Mutex<HashMap<String, Slot>>,
    rc: Mutex<HashMap<String, Slot>>,
    release: Mutex<HashMap<String, Slot>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: CacheSnapshot) -> Self {
        let cache = Self::new();
        for kind in CacheKind::ALL {
            for (key, value) in snapshot.map(kind) {
                cache.insert(kind, key, value.clone());
            }
        }
        cache
    }

    /// Load the snapshot at `path`. A missing file yields an empty cache.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cache file: {}", path.display()))?;
        let snapshot: CacheSnapshot = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse cache file: {}", path.display()))?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Like [`load`](Self::load), but a corrupt file is reported and ignored.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!("Ignoring unusable metadata cache: {:#}", e);
                Self::new()
            }
        }
    }

    /// Atomically replace the snapshot at `path` with the current state.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache folder: {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        serde_json::to_writer(&mut tmp, &self.snapshot())?;
        tmp.flush()?;
        tmp.persist(path)
            .with_context(|| format!("Failed to replace cache file: {}", path.display()))?;
        Ok(())
    }

    /// Return the cached value for `key`, or run `init` exactly once across
    /// all callers of the run and cache its result.
    ///
    /// The caller that ran a failing `init` gets its error back. Every other
    /// caller, concurrent or later, gets [`Unavailable`].
    pub async fn resolve<F, Fut, E>(
        &self,
        kind: CacheKind,
        key: &str,
        init: F,
    ) -> Result<Option<Metadata>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Metadata>, E>>,
        E: std::fmt::Display + From<Unavailable>,
    {
        let slot = self.slot(kind, key);
        let mut failure: Option<E> = None;
        let settle = async {
            match init().await {
                Ok(value) => Settled::Known(value),
                Err(e) => {
                    let reason = e.to_string();
                    failure = Some(e);
                    Settled::Unavailable(reason)
                }
            }
        };
        let settled = slot.get_or_init(|| settle).await.clone();

        match settled {
            Settled::Known(value) => Ok(value),
            Settled::Unavailable(reason) => Err(failure.unwrap_or_else(|| {
                E::from(Unavailable {
                    key: key.to_string(),
                    reason,
                })
            })),
        }
    }

    /// Settled value for `key`: `Some(None)` is a known-absent entry,
    /// `None` means the key is not known (never resolved, or unavailable).
    pub fn get(&self, kind: CacheKind, key: &str) -> Option<Option<Metadata>> {
        let map = self.lock(kind);
        map.get(key)
            .and_then(|slot| slot.get())
            .and_then(Settled::known)
            .cloned()
    }

    pub fn insert(&self, kind: CacheKind, key: &str, value: Option<Metadata>) {
        let cell = OnceCell::new_with(Some(Settled::Known(value)));
        self.lock(kind).insert(key.to_string(), Arc::new(cell));
    }

    /// Number of known entries (present or absent) in one map.
    pub fn len(&self, kind: CacheKind) -> usize {
        self.lock(kind)
            .values()
            .filter(|slot| slot.get().and_then(Settled::known).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        CacheKind::ALL.iter().all(|kind| self.len(*kind) == 0)
    }

    pub fn counts(&self, kind: CacheKind) -> CacheCounts {
        let map = self.lock(kind);
        let mut counts = CacheCounts::default();
        for value in map
            .values()
            .filter_map(|slot| slot.get().and_then(Settled::known))
        {
            if value.is_some() {
                counts.present += 1;
            } else {
                counts.absent += 1;
            }
        }
        counts
    }

    /// Known entries of all three maps. In-flight and unavailable lookups
    /// are left out.
    pub fn snapshot(&self) -> CacheSnapshot {
        let mut snapshot = CacheSnapshot::default();
        for kind in CacheKind::ALL {
            let map = self.lock(kind);
            let target = snapshot.map_mut(kind);
            for (key, slot) in map.iter() {
                if let Some(value) = slot.get().and_then(Settled::known) {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
        snapshot
    }

    fn slot(&self, kind: CacheKind, key: &str) -> Slot {
        self.lock(kind)
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    fn lock(&self, kind: CacheKind) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        let map = match kind {
            CacheKind::Nightly => &self.nightly,
            CacheKind::Rc => &self.rc,
            CacheKind::Release => &self.release,
        };
        map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Version-tagged cache file inside `folder`.
pub fn cache_file_path(folder: &Path) -> PathBuf {
    folder.join(format!(".metadata-{}.json", env!("CARGO_PKG_VERSION")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn doc(build_id: &str) -> Metadata {
        Metadata::from_pairs([("buildid", build_id)])
    }

    #[tokio::test]
    async fn resolve_runs_initializer_once() {
        let cache = MetadataCache::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = cache
                .resolve(CacheKind::Nightly, "k", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Unavailable>(Some(doc("1")))
                })
                .await
                .unwrap();
            assert_eq!(value.unwrap().build_id().as_deref(), Some("1"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_flight() {
        let cache = MetadataCache::new();
        let calls = AtomicUsize::new(0);
        let lookup = || {
            cache.resolve(CacheKind::Rc, "k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok::<_, Unavailable>(None)
            })
        };
        let (a, b) = tokio::join!(lookup(), lookup());
        assert_eq!(a.unwrap(), None);
        assert_eq!(b.unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn timed_out(key: &str) -> Unavailable {
        Unavailable {
            key: key.to_string(),
            reason: "timeout".to_string(),
        }
    }

    #[tokio::test]
    async fn failure_settles_the_key_for_the_run() {
        let cache = MetadataCache::new();
        let calls = AtomicUsize::new(0);
        let failed = cache
            .resolve(CacheKind::Release, "k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Option<Metadata>, _>(timed_out("k"))
            })
            .await;
        assert!(failed.is_err());

        let again = cache
            .resolve(CacheKind::Release, "k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Unavailable>(Some(doc("2")))
            })
            .await;
        let err = again.unwrap_err();
        assert_eq!(err.key, "k");
        assert_eq!(err.reason, "timeout");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(cache.get(CacheKind::Release, "k"), None);
        assert_eq!(cache.len(CacheKind::Release), 0);
        assert!(cache.snapshot().release.is_empty());
    }

    #[tokio::test]
    async fn waiters_share_a_failed_flight() {
        let cache = MetadataCache::new();
        let calls = AtomicUsize::new(0);
        let lookup = || {
            cache.resolve(CacheKind::Nightly, "k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Err::<Option<Metadata>, _>(timed_out("k"))
            })
        };
        let (a, b, c) = tokio::join!(lookup(), lookup(), lookup());
        assert!(a.is_err() && b.is_err() && c.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unavailable_keys_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = cache_file_path(dir.path());
        let cache = MetadataCache::new();
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _ = runtime.block_on(cache.resolve(CacheKind::Nightly, "k", || async {
            Err::<Option<Metadata>, _>(timed_out("k"))
        }));
        cache.persist(&path).unwrap();

        let reloaded = MetadataCache::load(&path).unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn kinds_are_independent() {
        let cache = MetadataCache::new();
        cache.insert(CacheKind::Nightly, "k", None);
        assert_eq!(cache.get(CacheKind::Nightly, "k"), Some(None));
        assert_eq!(cache.get(CacheKind::Rc, "k"), None);
        assert_eq!(cache.len(CacheKind::Nightly), 1);
        assert_eq!(cache.len(CacheKind::Release), 0);
    }

    #[test]
    fn persist_and_reload_keeps_absent_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = cache_file_path(dir.path());

        let cache = MetadataCache::new();
        cache.insert(CacheKind::Nightly, "a", Some(doc("20200101000000")));
        cache.insert(CacheKind::Release, "b", None);
        cache.persist(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["release"]["b"].is_null());
        assert_eq!(raw["nightly"]["a"]["buildid"], "20200101000000");
        assert!(raw["rc"].as_object().unwrap().is_empty());

        let reloaded = MetadataCache::load(&path).unwrap();
        assert_eq!(reloaded.get(CacheKind::Release, "b"), Some(None));
        assert_eq!(
            reloaded.counts(CacheKind::Nightly),
            CacheCounts {
                present: 1,
                absent: 0
            }
        );
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetadataCache::load(&dir.path().join("nope.json")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn corrupt_file_is_ignored_by_load_or_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(MetadataCache::load(&path).is_err());
        assert!(MetadataCache::load_or_default(&path).is_empty());
    }

    #[test]
    fn cache_file_name_carries_version() {
        let path = cache_file_path(Path::new("/tmp"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(".metadata-"));
        assert!(name.ends_with(".json"));
    }
}
