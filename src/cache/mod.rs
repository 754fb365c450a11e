use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

use crate::config::CacheConfig;
use crate::coverage::{CoverageAnalysisParams, CoverageGrid};

/// Canonical request key.
///
/// Center rounded to 2 decimals (~1 km), radius to the nearest 1000 m,
/// joined with zoom, peer extension, detail level, both antenna heights and
/// the effective cell size.
#[derive(Hash, PartialEq, Eq, Clone, Debug)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(params: &CoverageAnalysisParams) -> Self {
        let lat = (params.center.latitude * 100.0).round() / 100.0;
        let lon = (params.center.longitude * 100.0).round() / 100.0;
        let radius = ((params.radius_m / 1000.0).round() * 1000.0) as i64;
        // `+ 0.0` folds -0.0 into 0.0 so both hemispheres' zero agree.
        Self(format!(
            "{:.2}_{:.2}_{}_{}_{}_{}_{:.1}_{:.1}_{:.1}",
            lat + 0.0,
            lon + 0.0,
            radius,
            params.zoom_level,
            params.include_peer_extension,
            params.detail_level,
            params.user_antenna_height_feet,
            params.receiving_antenna_height_feet,
            params.resolution_m,
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct CachedCoverageGrid {
    pub grid: Arc<CoverageGrid>,
    pub cached_at: Instant,
}

impl CachedCoverageGrid {
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.cached_at) > ttl
    }
}

#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(Arc<CoverageGrid>),
    /// Entry was present but stale; it has been evicted.
    Expired,
    Miss,
}

/// Bounded, TTL-expiring store of computed grids.
///
/// Reads never promote entries, so the LRU order is insertion order and
/// the entry evicted on overflow is always the oldest cached one.
pub struct CoverageCache {
    ttl: Duration,
    cache: Mutex<LruCache<CacheKey, CachedCoverageGrid>>,
}

impl CoverageCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl: config.ttl(),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<CacheKey, CachedCoverageGrid>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.entries().cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, key: &CacheKey) -> CacheLookup {
        self.lookup_at(key, Instant::now())
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CoverageGrid>> {
        match self.lookup(key) {
            CacheLookup::Hit(grid) => Some(grid),
            CacheLookup::Expired | CacheLookup::Miss => None,
        }
    }

    pub(crate) fn lookup_at(&self, key: &CacheKey, now: Instant) -> CacheLookup {
        let mut cache = self.entries();
        match cache.peek(key) {
            None => return CacheLookup::Miss,
            Some(entry) if !entry.is_expired(now, self.ttl) => return CacheLookup::Hit(entry.grid.clone()),
            Some(_) => {}
        }
        cache.pop(key);
        debug!(%key, "evicted expired coverage grid");
        CacheLookup::Expired
    }

    /// Stores `grid`, returning the key evicted to make room, if any.
    pub fn insert(&self, key: CacheKey, grid: Arc<CoverageGrid>) -> Option<CacheKey> {
        self.insert_at(key, grid, Instant::now())
    }

    pub(crate) fn insert_at(&self, key: CacheKey, grid: Arc<CoverageGrid>, now: Instant) -> Option<CacheKey> {
        let entry = CachedCoverageGrid { grid, cached_at: now };
        let mut cache = self.entries();
        match cache.push(key.clone(), entry) {
            Some((evicted, _)) if evicted != key => {
                debug!(%evicted, "cache full, evicted oldest coverage grid");
                Some(evicted)
            }
            _ => None,
        }
    }

    /// Drops every stale entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.entries();
        let stale: Vec<CacheKey> = cache
            .iter()
            .filter(|(_, entry)| entry.is_expired(now, self.ttl))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            cache.pop(key);
        }
        stale.len()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}
