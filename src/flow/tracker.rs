//! TTL-bounded flow table
//!
//! Maps the source tuple of an intercepted connection to its original
//! (pre-redirect) destination. Entries are written by the event consumer
//! task and read by the proxy's connection handlers; expiry follows the
//! kernel-reported timeout with a configurable fallback.
//!
//! Writes for the same key resolve in channel order inside a single
//! consumer task, so a destroy observed after an establish always wins.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::event::{FlowEvent, FlowKey};

/// Delay between lookup attempts while the establish event races the
/// intercepted connection's arrival
const LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Lookup attempts before giving up
const LOOKUP_ATTEMPTS: u32 = 3;

/// Event filter: `true` means "ignore this event"
pub type FlowFilter = Box<dyn Fn(&FlowKey) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct FlowEntry {
    dest: SocketAddr,
    deadline: tokio::time::Instant,
}

/// Flow table statistics
#[derive(Debug, Default)]
pub struct FlowStats {
    pub inserted: AtomicU64,
    pub refreshed: AtomicU64,
    pub destroyed: AtomicU64,
    pub swept: AtomicU64,
    pub lookups: AtomicU64,
    pub hits: AtomicU64,
}

/// Point-in-time view of [`FlowStats`]
#[derive(Debug, Clone, Copy)]
pub struct FlowStatsSnapshot {
    pub inserted: u64,
    pub refreshed: u64,
    pub destroyed: u64,
    pub swept: u64,
    pub lookups: u64,
    pub hits: u64,
}

impl FlowStats {
    fn snapshot(&self) -> FlowStatsSnapshot {
        FlowStatsSnapshot {
            inserted: self.inserted.load(Ordering::Relaxed),
            refreshed: self.refreshed.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }
}

/// Source-tuple to original-destination table
pub struct FlowTracker {
    table: RwLock<HashMap<FlowKey, FlowEntry>>,
    filters: Vec<FlowFilter>,
    fallback_ttl: Duration,
    stats: FlowStats,
}

impl FlowTracker {
    /// Create a tracker with the given event filters and fallback TTL
    #[must_use]
    pub fn new(filters: Vec<FlowFilter>, fallback_ttl: Duration) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            filters,
            fallback_ttl,
            stats: FlowStats::default(),
        }
    }

    /// Apply one event to the table
    pub fn apply(&self, event: &FlowEvent) {
        if self.filters.iter().any(|f| f(event.key())) {
            return;
        }

        match *event {
            FlowEvent::Established { key, dest, timeout } => {
                let deadline =
                    tokio::time::Instant::now() + timeout.unwrap_or(self.fallback_ttl);
                let mut table = self.table.write();
                match table.entry(key) {
                    std::collections::hash_map::Entry::Occupied(mut slot) => {
                        // First writer wins on the destination; later events
                        // for the flow only extend its lifetime.
                        slot.get_mut().deadline = deadline;
                        self.stats.refreshed.fetch_add(1, Ordering::Relaxed);
                    }
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(FlowEntry { dest, deadline });
                        self.stats.inserted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            FlowEvent::Destroyed { key } => {
                if self.table.write().remove(&key).is_some() {
                    self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Look up the original destination for a source tuple.
    ///
    /// Expired entries are treated as absent (the sweeper removes them
    /// later).
    #[must_use]
    pub fn lookup(&self, key: &FlowKey) -> Option<SocketAddr> {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        let table = self.table.read();
        let entry = table.get(key)?;
        if entry.deadline <= tokio::time::Instant::now() {
            return None;
        }
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.dest)
    }

    /// Look up with bounded retries, for the race between the redirected
    /// connection's accept and the kernel event's arrival.
    pub async fn lookup_retrying(&self, key: &FlowKey) -> Option<SocketAddr> {
        for attempt in 0..LOOKUP_ATTEMPTS {
            if let Some(dest) = self.lookup(key) {
                return Some(dest);
            }
            if attempt + 1 < LOOKUP_ATTEMPTS {
                tokio::time::sleep(LOOKUP_RETRY_DELAY).await;
            }
        }
        None
    }

    /// Remove expired entries; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = tokio::time::Instant::now();
        let mut table = self.table.write();
        let before = table.len();
        table.retain(|_, entry| entry.deadline > now);
        let removed = before - table.len();
        if removed > 0 {
            self.stats
                .swept
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, remaining = table.len(), "Swept expired flows");
        }
        removed
    }

    /// Number of live entries (including not-yet-swept expired ones)
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// True when the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> FlowStatsSnapshot {
        self.stats.snapshot()
    }

    /// Consume events from `rx` until the channel closes
    pub fn spawn_consumer(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<FlowEvent>,
    ) -> JoinHandle<()> {
        let tracker = self;
        tokio::spawn(async move {
            info!("Flow event consumer started");
            while let Some(event) = rx.recv().await {
                tracker.apply(&event);
            }
            info!("Flow event consumer stopped");
        })
    }

    /// Periodically sweep expired entries
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let tracker = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracker.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn key(port: u16) -> FlowKey {
        FlowKey {
            addr: "192.168.1.10".parse::<IpAddr>().unwrap(),
            port,
            proto: 6,
        }
    }

    fn established(port: u16, dest: &str, timeout: Option<Duration>) -> FlowEvent {
        FlowEvent::Established {
            key: key(port),
            dest: dest.parse().unwrap(),
            timeout,
        }
    }

    #[tokio::test]
    async fn test_establish_then_lookup() {
        let tracker = FlowTracker::new(vec![], Duration::from_secs(60));
        tracker.apply(&established(40000, "93.184.216.34:443", None));

        assert_eq!(
            tracker.lookup(&key(40000)),
            Some("93.184.216.34:443".parse().unwrap())
        );
        assert_eq!(tracker.lookup(&key(40001)), None);
    }

    #[tokio::test]
    async fn test_destroy_wins() {
        let tracker = FlowTracker::new(vec![], Duration::from_secs(60));
        tracker.apply(&established(40000, "93.184.216.34:443", None));
        tracker.apply(&FlowEvent::Destroyed { key: key(40000) });
        assert_eq!(tracker.lookup(&key(40000)), None);
    }

    #[tokio::test]
    async fn test_first_writer_wins_on_destination() {
        let tracker = FlowTracker::new(vec![], Duration::from_secs(60));
        tracker.apply(&established(40000, "93.184.216.34:443", None));
        tracker.apply(&established(40000, "198.51.100.1:80", None));

        assert_eq!(
            tracker.lookup(&key(40000)),
            Some("93.184.216.34:443".parse().unwrap())
        );
        let stats = tracker.stats();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.refreshed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_at_lookup_and_sweep() {
        let tracker = FlowTracker::new(vec![], Duration::from_secs(60));
        tracker.apply(&established(
            40000,
            "93.184.216.34:443",
            Some(Duration::from_secs(5)),
        ));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(tracker.lookup(&key(40000)), None);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.sweep(), 1);
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_deadline() {
        let tracker = FlowTracker::new(vec![], Duration::from_secs(60));
        tracker.apply(&established(
            40000,
            "93.184.216.34:443",
            Some(Duration::from_secs(5)),
        ));
        tokio::time::advance(Duration::from_secs(4)).await;
        tracker.apply(&established(
            40000,
            "93.184.216.34:443",
            Some(Duration::from_secs(5)),
        ));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(tracker.lookup(&key(40000)).is_some());
    }

    #[tokio::test]
    async fn test_filters_suppress_events() {
        let filters: Vec<FlowFilter> = vec![
            Box::new(|key: &FlowKey| key.proto != 6 || key.port == 53),
        ];
        let tracker = FlowTracker::new(filters, Duration::from_secs(60));

        tracker.apply(&FlowEvent::Established {
            key: FlowKey {
                addr: "192.168.1.10".parse().unwrap(),
                port: 53,
                proto: 6,
            },
            dest: "9.9.9.9:53".parse().unwrap(),
            timeout: None,
        });
        assert!(tracker.is_empty());

        tracker.apply(&established(40000, "93.184.216.34:443", None));
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_retrying_sees_late_insert() {
        let tracker = Arc::new(FlowTracker::new(vec![], Duration::from_secs(60)));

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.lookup_retrying(&key(40000)).await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        tracker.apply(&established(40000, "93.184.216.34:443", None));

        assert_eq!(
            waiter.await.unwrap(),
            Some("93.184.216.34:443".parse().unwrap())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_retrying_gives_up() {
        let tracker = FlowTracker::new(vec![], Duration::from_secs(60));
        assert_eq!(tracker.lookup_retrying(&key(40000)).await, None);
        assert_eq!(tracker.stats().lookups, 3);
    }
}
