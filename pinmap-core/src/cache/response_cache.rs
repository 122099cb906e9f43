//! `src/cache/response_cache.rs`
//! ============================================================================
//! # Versioned TTL Response Cache
//!
//! Shields the mapping provider's lookup endpoints from redundant calls:
//! - Keys are fingerprints of category, canonical request params, build
//!   version and environment, so a deploy invalidates everything at once
//! - Per-category TTL buckets with a standard and an aggressive tier
//! - Lazy expiry on `get`, inline sweep past a size threshold, and a
//!   timer-driven background sweep
//! - A hard capacity enforced oldest-first, so a fresh `set` is always
//!   readable until its TTL elapses
//! - Hit/miss/expiry statistics

use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use moka::sync::Cache;
use parking_lot::RwLock;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::{BuildInfo, CacheConfig, TtlTable},
    error::AppError,
    logging::MARKER_CACHE,
};

/// Fingerprint used as the storage key (uses Arc for cheap cloning)
pub type Fingerprint = Arc<str>;

/// Cache-specific errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Request params are not serializable: {0}")]
    InvalidParams(#[from] serde_json::Error),

    #[error("Lookup failed: {0}")]
    LoaderFailed(String),

    #[error("Unknown lookup category: {0}")]
    UnknownCategory(String),
}

impl From<CacheError> for AppError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e.to_string())
    }
}

/// Kinds of upstream lookup, each with its own TTL bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LookupCategory {
    PlaceDetails,
    Geocoding,
    Autocomplete,
    NearbySearch,
    TextSearch,
    DeviceLocation,
}

impl LookupCategory {
    pub const ALL: [Self; 6] = [
        Self::PlaceDetails,
        Self::Geocoding,
        Self::Autocomplete,
        Self::NearbySearch,
        Self::TextSearch,
        Self::DeviceLocation,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PlaceDetails => "place-details",
            Self::Geocoding => "geocoding",
            Self::Autocomplete => "autocomplete",
            Self::NearbySearch => "nearby-search",
            Self::TextSearch => "text-search",
            Self::DeviceLocation => "device-location",
        }
    }
}

impl fmt::Display for LookupCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LookupCategory {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CacheError::UnknownCategory(s.to_string()))
    }
}

/// Serialize params with object keys sorted at every level, so
/// `{lat, lng}` and `{lng, lat}` produce the same fingerprint.
fn canonical_params<P: Serialize + ?Sized>(params: &P) -> Result<String, CacheError> {
    fn sort(value: Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(String, Value)> = map.into_iter().collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                Value::Object(entries.into_iter().map(|(k, v)| (k, sort(v))).collect())
            }
            Value::Array(items) => Value::Array(items.into_iter().map(sort).collect()),
            other => other,
        }
    }

    let value = sort(serde_json::to_value(params)?);
    Ok(serde_json::to_string(&value)?)
}

/// Compute the storage key for a lookup under the given build.
#[must_use]
pub fn fingerprint(category: LookupCategory, canonical: &str, build: &BuildInfo) -> Fingerprint {
    let mut hasher = FxHasher::default();
    category.as_str().hash(&mut hasher);
    canonical.hash(&mut hasher);
    build.version.as_str().hash(&mut hasher);
    build.environment.as_str().hash(&mut hasher);

    Arc::from(format!(
        "{}:{}:{}:{:016x}",
        category,
        build.environment,
        build.version,
        hasher.finish()
    ))
}

/// Cache statistics for monitoring and debugging
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    sweeps: AtomicU64,
    swept: AtomicU64,
    evictions: AtomicU64,
    loads: AtomicU64,
    load_exceptions: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sweep(&self, evicted: u64) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.swept.fetch_add(evicted, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, evicted: u64) {
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
    }

    pub fn record_load(&self, success: bool) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.load_exceptions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_exceptions: self.load_exceptions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub sweeps: u64,
    pub swept: u64,
    /// Fresh entries dropped to stay within `max_capacity`
    pub evictions: u64,
    pub loads: u64,
    pub load_exceptions: u64,
}

impl CacheStatsSnapshot {
    #[expect(clippy::cast_precision_loss, reason = "Expected precision loss")]
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    category: LookupCategory,
    /// Canonical params, compared on read so a hash collision is a miss
    params: Arc<str>,
    build: Arc<BuildInfo>,
    payload: Value,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) <= self.ttl
    }
}

/// Fingerprinted, TTL-bucketed store for upstream lookup results
pub struct ResponseCache {
    inner: Cache<Fingerprint, CacheEntry>,
    build: RwLock<Arc<BuildInfo>>,
    ttl: TtlTable,
    config: CacheConfig,
    stats: Arc<CacheStats>,
}

impl ResponseCache {
    /// Create a cache bound to the running build
    #[must_use]
    pub fn new(config: CacheConfig, build: BuildInfo) -> Self {
        // Capacity is enforced in `set`; moka's admission policy could
        // reject a fresh insert.
        let inner = Cache::builder().build();

        Self {
            inner,
            build: RwLock::new(Arc::new(build)),
            ttl: config.active_ttl().clone(),
            config,
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// Get cache configuration
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// TTL assigned to a category under the active tier
    #[must_use]
    pub const fn ttl(&self, category: LookupCategory) -> Duration {
        self.ttl.ttl(category)
    }

    /// The build every new fingerprint is computed against
    #[must_use]
    pub fn build(&self) -> Arc<BuildInfo> {
        Arc::clone(&self.build.read())
    }

    /// Switch to a new build. Entries written under the old one can no
    /// longer be reached; with `force_bust` they are dropped right away,
    /// otherwise they stay in storage until swept.
    pub fn rebind(&self, build: BuildInfo) {
        {
            let mut current = self.build.write();
            info!(
                marker = MARKER_CACHE,
                operation_type = "rebind",
                from_version = %current.version,
                to_version = %build.version,
                environment = %build.environment,
                "Cache rebound to new build"
            );
            *current = Arc::new(build);
        }

        if self.config.force_bust {
            info!(
                marker = MARKER_CACHE,
                operation_type = "forced_bust",
                "Forced cache bust on rebind"
            );
            self.clear();
        }
    }

    fn key_for<P: Serialize + ?Sized>(
        &self,
        category: LookupCategory,
        params: &P,
    ) -> Result<(Fingerprint, String), CacheError> {
        let canonical = canonical_params(params)?;
        let fp = fingerprint(category, &canonical, &self.build.read());
        Ok((fp, canonical))
    }

    /// Fresh payload for this lookup, or `None`. A stale entry is evicted.
    #[instrument(skip(self, params), fields(category = %category))]
    pub fn get<P: Serialize + ?Sized>(&self, category: LookupCategory, params: &P) -> Option<Value> {
        let (fp, canonical) = match self.key_for(category, params) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    marker = MARKER_CACHE,
                    operation_type = "invalid_params",
                    error = %e,
                    "Treating unserializable params as a miss"
                );
                return None;
            }
        };

        let Some(entry) = self.inner.get(&fp) else {
            self.record(|s| s.record_miss());
            debug!(
                marker = MARKER_CACHE,
                operation_type = "cache_miss",
                cache_key = %fp,
                "Cache miss - key not found"
            );
            return None;
        };

        if *entry.params != *canonical {
            self.record(|s| s.record_miss());
            warn!(
                marker = MARKER_CACHE,
                operation_type = "fingerprint_collision",
                cache_key = %fp,
                "Fingerprint matched different params"
            );
            return None;
        }

        let now = Instant::now();
        let age = now.saturating_duration_since(entry.inserted_at);
        if !entry.is_fresh(now) {
            self.inner.invalidate(&fp);
            self.record(|s| {
                s.record_expiration();
                s.record_miss();
            });
            debug!(
                marker = MARKER_CACHE,
                operation_type = "cache_expired",
                cache_key = %fp,
                age_ms = age.as_millis(),
                ttl_ms = entry.ttl.as_millis(),
                "Stale entry evicted on read"
            );
            return None;
        }

        self.record(|s| s.record_hit());
        debug!(
            marker = MARKER_CACHE,
            operation_type = "cache_hit",
            cache_key = %fp,
            age_ms = age.as_millis(),
            "Cache hit"
        );
        Some(entry.payload)
    }

    /// Store a payload stamped with the current time and build
    #[instrument(skip(self, params, payload), fields(category = %category))]
    pub fn set<P: Serialize + ?Sized>(
        &self,
        category: LookupCategory,
        params: &P,
        payload: Value,
    ) -> Result<(), CacheError> {
        let (fp, canonical) = self.key_for(category, params)?;
        let entry = CacheEntry {
            category,
            params: Arc::from(canonical),
            build: self.build(),
            payload,
            inserted_at: Instant::now(),
            ttl: self.ttl(category),
        };

        self.inner.insert(fp.clone(), entry);
        debug!(
            marker = MARKER_CACHE,
            operation_type = "cache_insert",
            cache_key = %fp,
            "Inserted entry into cache"
        );

        let count = self.len();
        if count > self.config.sweep_threshold {
            debug!(
                marker = MARKER_CACHE,
                operation_type = "threshold_sweep",
                entry_count = count,
                threshold = self.config.sweep_threshold,
                "Entry count over threshold, sweeping"
            );
            self.sweep();
        }

        let count = self.len();
        if count > self.config.max_capacity {
            self.evict_oldest(count - self.config.max_capacity, &fp);
        }

        Ok(())
    }

    /// Drop the `excess` oldest entries, never `keep`.
    fn evict_oldest(&self, excess: u64, keep: &Fingerprint) {
        let mut by_age: Vec<(Instant, Arc<Fingerprint>)> = self
            .inner
            .iter()
            .filter(|(key, _)| **key != *keep)
            .map(|(key, entry)| (entry.inserted_at, key))
            .collect();
        by_age.sort_by_key(|(inserted_at, _)| *inserted_at);

        let doomed = usize::try_from(excess).unwrap_or(usize::MAX);
        for (_, key) in by_age.iter().take(doomed) {
            self.inner.invalidate(key.as_ref());
        }
        self.inner.run_pending_tasks();

        let evicted = by_age.len().min(doomed) as u64;
        self.record(|s| s.record_eviction(evicted));
        debug!(
            marker = MARKER_CACHE,
            operation_type = "capacity_eviction",
            evicted,
            max_capacity = self.config.max_capacity,
            "Evicted oldest entries over capacity"
        );
    }

    /// Return the cached payload, or run `loader`, cache its result and
    /// return it. Loader failures are not cached.
    #[instrument(skip(self, params, loader), fields(category = %category, operation_type = "cache_get_or_fetch"))]
    pub async fn get_or_fetch<P, F, Fut>(
        &self,
        category: LookupCategory,
        params: &P,
        loader: F,
    ) -> Result<Value, CacheError>
    where
        P: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        if let Some(hit) = self.get(category, params) {
            return Ok(hit);
        }

        let load_start = Instant::now();
        match loader().await {
            Ok(payload) => {
                self.record(|s| s.record_load(true));
                info!(
                    marker = MARKER_CACHE,
                    operation_type = "loader_success",
                    category = %category,
                    load_duration_ms = load_start.elapsed().as_millis(),
                    "Lookup succeeded, caching result"
                );
                self.set(category, params, payload.clone())?;
                Ok(payload)
            }
            Err(e) => {
                self.record(|s| s.record_load(false));
                warn!(
                    marker = MARKER_CACHE,
                    operation_type = "loader_failure",
                    category = %category,
                    load_duration_ms = load_start.elapsed().as_millis(),
                    error = %e,
                    "Lookup failed, not caching failure"
                );
                Err(CacheError::LoaderFailed(format!("{e:#}")))
            }
        }
    }

    /// Evict every entry past its TTL or written under another build.
    /// Returns the number of evicted entries.
    pub fn sweep(&self) -> u64 {
        let now = Instant::now();
        let build = self.build();

        let doomed: Vec<Arc<Fingerprint>> = self
            .inner
            .iter()
            .filter(|(_, entry)| !entry.is_fresh(now) || *entry.build != *build)
            .map(|(key, _)| key)
            .collect();

        for key in &doomed {
            self.inner.invalidate(key.as_ref());
        }
        self.inner.run_pending_tasks();

        let evicted = doomed.len() as u64;
        self.record(|s| s.record_sweep(evicted));
        debug!(
            marker = MARKER_CACHE,
            operation_type = "sweep_complete",
            evicted,
            remaining = self.inner.entry_count(),
            "Sweep completed"
        );
        evicted
    }

    /// Run [`Self::sweep`] every `sweep_interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(marker = MARKER_CACHE, operation_type = "sweeper_stopped", "Sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                }
            }
        })
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks();
        info!(
            marker = MARKER_CACHE,
            operation_type = "cache_clear",
            "Cache cleared"
        );
    }

    /// Current entry count, after applying pending maintenance
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-category entry counts, mostly for diagnostics
    #[must_use]
    pub fn category_counts(&self) -> Vec<(LookupCategory, usize)> {
        LookupCategory::ALL
            .into_iter()
            .map(|c| (c, self.inner.iter().filter(|(_, e)| e.category == c).count()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    /// Get cache statistics snapshot
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        if self.config.enable_stats {
            self.stats.snapshot()
        } else {
            CacheStatsSnapshot::default()
        }
    }

    fn record(&self, f: impl FnOnce(&CacheStats)) {
        if self.config.enable_stats {
            f(&self.stats);
        }
    }
}

#[expect(
    clippy::missing_fields_in_debug,
    reason = "Intended loss of debug data"
)]
impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("build", &self.build.read().version)
            .field("entry_count", &self.inner.entry_count())
            .finish()
    }
}
