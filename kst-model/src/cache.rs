//! Partition-local path cache keyed by parameter fingerprints.
//!
//! The model is static for the lifetime of a run, so cached traversals are never
//! invalidated; entries only leave the cache through bounded least-recently-used
//! eviction.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;

use lru::LruCache;

use kst_common::error::{KstError, KstResult};

use crate::graph::PathEstimate;

/// Computes the fingerprint of one bound parameter list.
///
/// Two submissions of the same procedure with byte-identical parameters produce the
/// same fingerprint and can reuse one cached traversal.
#[must_use]
pub fn parameter_fingerprint(params: &[Vec<u8>]) -> u64 {
    let mut hasher = DefaultHasher::new();
    params.len().hash(&mut hasher);
    for param in params {
        param.hash(&mut hasher);
    }
    hasher.finish()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    procedure: String,
    fingerprint: u64,
}

/// Bounded LRU cache of path traversals for one partition.
pub struct PathCache {
    entries: LruCache<CacheKey, PathEstimate>,
}

impl std::fmt::Debug for PathCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathCache")
            .field("entries", &self.entries.len())
            .field("capacity", &self.entries.cap())
            .finish()
    }
}

impl PathCache {
    /// Creates a cache bounded to `capacity` traversals.
    ///
    /// # Errors
    ///
    /// Returns `KstError::InvalidConfig` when `capacity` is zero.
    pub fn new(capacity: usize) -> KstResult<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or(KstError::InvalidConfig("path cache capacity must be non-zero"))?;
        Ok(Self {
            entries: LruCache::new(capacity),
        })
    }

    /// Returns the cached traversal for one procedure/fingerprint pair.
    pub fn get(&mut self, procedure: &str, fingerprint: u64) -> Option<PathEstimate> {
        let key = CacheKey {
            procedure: procedure.to_owned(),
            fingerprint,
        };
        self.entries.get(&key).cloned()
    }

    /// Stores one traversal, evicting the least recently used entry when full.
    pub fn insert(&mut self, procedure: &str, fingerprint: u64, estimate: PathEstimate) {
        let key = CacheKey {
            procedure: procedure.to_owned(),
            fingerprint,
        };
        let _ = self.entries.put(key, estimate);
    }

    /// Returns the number of cached traversals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
