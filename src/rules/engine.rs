//! Hot-reloadable domain classifier
//!
//! The classifier holds an immutable [`ClassifierSnapshot`] behind an
//! `ArcSwap` so the DNS server's per-query reads are lock-free while a
//! reload builds and swaps in a fresh snapshot.
//!
//! ```text
//! Query  -> Classifier::is_tunneled() -> ArcSwap::load() -> ClassifierSnapshot
//!                                              |
//!                                       (lock-free read)
//!
//! Reload -> Classifier::replace() -> ArcSwap::store() -> old snapshot dropped
//!                                                        when readers finish
//! ```
//!
//! Two lists live in a snapshot: the tunnel list (names resolved through the
//! tunnel) and the user-block list (names answered empty, checked first).

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use super::matcher::RuleSet;

/// Immutable classification state, replaced wholesale on reload
#[derive(Debug, Default)]
pub struct ClassifierSnapshot {
    /// Names matched here resolve through the tunnel
    pub tunnel: RuleSet,
    /// Names matched here are refused locally, before classification
    pub user_block: RuleSet,
    /// Monotonic reload counter, for logs
    pub version: u64,
}

/// Lock-free domain classifier
pub struct Classifier {
    inner: ArcSwap<ClassifierSnapshot>,
}

impl Classifier {
    /// Create a classifier from an initial snapshot
    #[must_use]
    pub fn new(snapshot: ClassifierSnapshot) -> Self {
        Self {
            inner: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Should this name be resolved (and its traffic carried) through the
    /// tunnel?
    #[must_use]
    pub fn is_tunneled(&self, name: &str) -> bool {
        let name = normalize(name);
        self.inner.load().tunnel.is_blocked(&name)
    }

    /// Has the user refused this name outright?
    #[must_use]
    pub fn is_user_blocked(&self, name: &str) -> bool {
        let name = normalize(name);
        self.inner.load().user_block.is_blocked(&name)
    }

    /// Atomically replace the live snapshot
    pub fn replace(&self, mut snapshot: ClassifierSnapshot) {
        snapshot.version = self.inner.load().version + 1;
        info!(
            version = snapshot.version,
            tunnel_rules = snapshot.tunnel.len(),
            block_rules = snapshot.user_block.len(),
            "Classifier snapshot replaced"
        );
        self.inner.store(Arc::new(snapshot));
    }

    /// Current snapshot version
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.load().version
    }
}

/// Lowercase, strip a trailing dot, and strip a `:port` suffix.
fn normalize(name: &str) -> String {
    let name = name.trim_end_matches('.');
    let name = name.rsplit_once(':').map_or(name, |(host, _)| host);
    name.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(tunnel: &str, block: &str) -> ClassifierSnapshot {
        ClassifierSnapshot {
            tunnel: RuleSet::parse(tunnel),
            user_block: RuleSet::parse(block),
            version: 0,
        }
    }

    #[test]
    fn test_classification_is_normalized() {
        let classifier = Classifier::new(snapshot("||example.com\n", ""));
        assert!(classifier.is_tunneled("example.com"));
        assert!(classifier.is_tunneled("EXAMPLE.COM."));
        assert!(classifier.is_tunneled("www.example.com:443"));
        assert!(!classifier.is_tunneled("example.org"));
    }

    #[test]
    fn test_user_block_is_separate() {
        let classifier = Classifier::new(snapshot("||example.com\n", "||ads.example.net\n"));
        assert!(classifier.is_user_blocked("ads.example.net"));
        assert!(!classifier.is_user_blocked("example.com"));
        assert!(!classifier.is_tunneled("ads.example.net"));
    }

    #[test]
    fn test_replace_swaps_and_versions() {
        let classifier = Classifier::new(snapshot("||old.example\n", ""));
        assert!(classifier.is_tunneled("old.example"));
        assert_eq!(classifier.version(), 0);

        classifier.replace(snapshot("||new.example\n", ""));
        assert!(!classifier.is_tunneled("old.example"));
        assert!(classifier.is_tunneled("new.example"));
        assert_eq!(classifier.version(), 1);
    }
}
