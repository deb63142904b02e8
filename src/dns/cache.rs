//! DNS answer cache
//!
//! TTL cache keyed by `(name, record type)`. Expiry drives refresh: when an
//! entry ages out, the eviction listener hands its key to a background
//! worker which re-resolves it through whatever path the *current*
//! classification dictates. Entries that nothing asked for within twice the
//! TTL are allowed to die quietly, so the refresh loop follows demand
//! instead of keeping every name ever queried warm forever.
//!
//! Values carry a last-served timestamp updated on every hit; the listener
//! uses it for the demand check.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::rr::{Record, RecordType};
use moka::notification::RemovalCause;
use moka::sync::Cache;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Cache key: lowercased absolute name plus the query type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub name: String,
    pub rtype: RecordType,
}

impl CacheKey {
    /// Normalized key for a query name
    #[must_use]
    pub fn new(name: &str, rtype: RecordType) -> Self {
        let mut name = name.to_ascii_lowercase();
        if !name.ends_with('.') {
            name.push('.');
        }
        Self { name, rtype }
    }
}

/// Work order for the refresh worker: the expired key plus the demand
/// timestamp it died with. A refreshed entry inherits the timestamp, so a
/// name nobody asks for again survives exactly one refresh cycle before the
/// demand window closes on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTicket {
    pub key: CacheKey,
    pub last_served: Instant,
}

/// Cached answer with its demand timestamp
#[derive(Debug)]
pub struct CacheEntry {
    pub records: Vec<Record>,
    last_served: Mutex<Instant>,
}

impl CacheEntry {
    fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            last_served: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_served.lock() = Instant::now();
    }

    fn served_within(&self, window: Duration) -> bool {
        self.last_served.lock().elapsed() <= window
    }

    /// When this entry was last handed to a client
    #[must_use]
    pub fn last_served(&self) -> Instant {
        *self.last_served.lock()
    }
}

/// Cache statistics
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    refreshes_queued: AtomicU64,
    expired_cold: AtomicU64,
}

/// Point-in-time view of the cache counters
#[derive(Debug, Clone, Copy)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub refreshes_queued: u64,
    pub expired_cold: u64,
}

/// TTL answer cache with refresh-on-expiry
pub struct AnswerCache {
    cache: Cache<CacheKey, Arc<CacheEntry>>,
    stats: Arc<CacheStats>,
}

impl AnswerCache {
    /// Create a cache whose expired entries are queued on `refresh_tx`
    /// when they were served within `2 * ttl`.
    #[must_use]
    pub fn new(
        ttl: Duration,
        max_entries: u64,
        refresh_tx: mpsc::UnboundedSender<RefreshTicket>,
    ) -> Self {
        let stats = Arc::new(CacheStats::default());
        let stats_for_listener = Arc::clone(&stats);
        let demand_window = ttl * 2;

        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .eviction_listener(move |key: Arc<CacheKey>, entry: Arc<CacheEntry>, cause| {
                if cause != RemovalCause::Expired {
                    return;
                }
                if !entry.served_within(demand_window) {
                    stats_for_listener.expired_cold.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                debug!(name = %key.name, rtype = %key.rtype, "Queueing cache refresh");
                stats_for_listener
                    .refreshes_queued
                    .fetch_add(1, Ordering::Relaxed);
                // A closed channel means shutdown; nothing to do.
                let _ = refresh_tx.send(RefreshTicket {
                    key: (*key).clone(),
                    last_served: entry.last_served(),
                });
            })
            .build();

        Self { cache, stats }
    }

    /// Fetch a cached answer, marking it as served
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        match self.cache.get(key) {
            Some(entry) => {
                entry.touch();
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store an answer, resetting its TTL and demand timestamp
    pub fn insert(&self, key: CacheKey, records: Vec<Record>) {
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        self.cache.insert(key, Arc::new(CacheEntry::new(records)));
    }

    /// Re-store a refreshed answer while preserving demand: the refreshed
    /// entry starts a new TTL but is only as "wanted" as its last hit.
    pub fn reinsert(&self, key: CacheKey, records: Vec<Record>, last_served: Instant) {
        let entry = CacheEntry {
            records,
            last_served: Mutex::new(last_served),
        };
        self.cache.insert(key, Arc::new(entry));
    }

    /// Run moka's pending maintenance so expirations fire promptly.
    ///
    /// Called from a periodic task; moka otherwise amortizes this work
    /// into reads and writes.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    /// True when nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.entry_count() == 0
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            inserts: self.stats.inserts.load(Ordering::Relaxed),
            refreshes_queued: self.stats.refreshes_queued.load(Ordering::Relaxed),
            expired_cold: self.stats.expired_cold.load(Ordering::Relaxed),
        }
    }
}
