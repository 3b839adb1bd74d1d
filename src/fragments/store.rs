//! Fragment Stores
//!
//! Read-only access to the fragment catalog. Each request works on one
//! immutable snapshot; nothing here mutates a library that a request holds.

use crate::error::{QueryError, Result};
use crate::fragments::FragmentLibrary;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[async_trait]
pub trait FragmentStore: Send + Sync {
    async fn load_fragment_library(&self) -> Result<Arc<FragmentLibrary>>;
}

/// Serves a fixed library. Used for tests and embedded catalogs.
pub struct StaticFragmentStore {
    library: Arc<FragmentLibrary>,
}

impl StaticFragmentStore {
    pub fn new(library: FragmentLibrary) -> Self {
        Self {
            library: Arc::new(library),
        }
    }
}

#[async_trait]
impl FragmentStore for StaticFragmentStore {
    async fn load_fragment_library(&self) -> Result<Arc<FragmentLibrary>> {
        Ok(Arc::clone(&self.library))
    }
}

/// Reads the catalog from a JSON document on disk on every load.
pub struct JsonFragmentStore {
    path: PathBuf,
}

impl JsonFragmentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FragmentStore for JsonFragmentStore {
    async fn load_fragment_library(&self) -> Result<Arc<FragmentLibrary>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            QueryError::Store(format!(
                "Failed to read fragment library {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let library: FragmentLibrary = serde_json::from_str(&raw).map_err(|e| {
            QueryError::Store(format!(
                "Failed to parse fragment library {}: {}",
                self.path.display(),
                e
            ))
        })?;

        for issue in library.validate() {
            warn!("Fragment library {}: {}", self.path.display(), issue);
        }
        info!(
            "Loaded {} fragments from {}",
            library.len(),
            self.path.display()
        );

        Ok(Arc::new(library))
    }
}

struct CachedSnapshot {
    library: Arc<FragmentLibrary>,
    loaded_at: Instant,
}

/// Wraps another store and hands out the same snapshot until it expires.
///
/// Construct once per process and share by reference. Concurrent requests
/// holding an older `Arc` keep their snapshot after a refresh.
pub struct CachedFragmentStore {
    inner: Arc<dyn FragmentStore>,
    ttl: Duration,
    snapshot: RwLock<Option<CachedSnapshot>>,
}

impl CachedFragmentStore {
    pub fn new(inner: Arc<dyn FragmentStore>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            snapshot: RwLock::new(None),
        }
    }

    /// Current snapshot if it has not expired.
    pub async fn get(&self) -> Option<Arc<FragmentLibrary>> {
        let guard = self.snapshot.read().await;
        guard
            .as_ref()
            .filter(|s| s.loaded_at.elapsed() < self.ttl)
            .map(|s| Arc::clone(&s.library))
    }

    /// Replace the snapshot, e.g. after an admin edit.
    pub async fn set(&self, library: Arc<FragmentLibrary>) {
        *self.snapshot.write().await = Some(CachedSnapshot {
            library,
            loaded_at: Instant::now(),
        });
    }

    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
    }
}

#[async_trait]
impl FragmentStore for CachedFragmentStore {
    async fn load_fragment_library(&self) -> Result<Arc<FragmentLibrary>> {
        if let Some(library) = self.get().await {
            debug!("Fragment library served from cache");
            return Ok(library);
        }

        let mut guard = self.snapshot.write().await;
        // Another request may have refreshed while we waited for the lock.
        if let Some(snapshot) = guard.as_ref() {
            if snapshot.loaded_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&snapshot.library));
            }
        }

        let library = self.inner.load_fragment_library().await?;
        *guard = Some(CachedSnapshot {
            library: Arc::clone(&library),
            loaded_at: Instant::now(),
        });
        Ok(library)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragments::test_support::fragment;
    use crate::fragments::FragmentType;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl FragmentStore for CountingStore {
        async fn load_fragment_library(&self) -> Result<Arc<FragmentLibrary>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FragmentLibrary::from_fragments(vec![fragment(
                "students_base",
                FragmentType::Base,
                "SELECT s.ID FROM STU s",
            )])))
        }
    }

    #[tokio::test]
    async fn test_cache_reuses_snapshot_until_invalidated() {
        let inner = Arc::new(CountingStore {
            loads: AtomicUsize::new(0),
        });
        let cache = CachedFragmentStore::new(inner.clone(), Duration::from_secs(600));

        let first = cache.load_fragment_library().await.unwrap();
        let second = cache.load_fragment_library().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(inner.loads.load(Ordering::SeqCst), 1);

        cache.invalidate().await;
        assert!(cache.get().await.is_none());
        let third = cache.load_fragment_library().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(inner.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_expires_after_ttl() {
        let inner = Arc::new(CountingStore {
            loads: AtomicUsize::new(0),
        });
        let cache = CachedFragmentStore::new(inner.clone(), Duration::ZERO);
        cache.load_fragment_library().await.unwrap();
        cache.load_fragment_library().await.unwrap();
        assert_eq!(inner.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_json_store_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"students": {{"core": [{{"id": "students_base", "name": "Students", "snippet": "SELECT s.ID FROM STU s", "type": "base"}}]}}}}"#
        )
        .unwrap();

        let store = JsonFragmentStore::new(file.path());
        let library = store.load_fragment_library().await.unwrap();
        assert_eq!(library.base_ids(), vec!["students_base"]);
    }

    #[tokio::test]
    async fn test_json_store_missing_file_is_store_error() {
        let store = JsonFragmentStore::new("/definitely/not/here.json");
        let err = store.load_fragment_library().await.unwrap_err();
        assert!(matches!(err, QueryError::Store(_)));
    }
}
