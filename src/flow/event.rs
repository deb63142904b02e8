//! Flow event model
//!
//! Events originate in the kernel's connection-tracking table and reach the
//! tracker through a bounded channel. The producer never blocks: when the
//! consumer falls behind, the event is dropped and counted. A dropped
//! establish event only delays recovery of a destination until the kernel's
//! next update event for the same flow.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

/// Identity of a tracked flow, as seen from the intercepted side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Source address of the original connection
    pub addr: IpAddr,
    /// Source port of the original connection
    pub port: u16,
    /// IP protocol number (6 = TCP)
    pub proto: u8,
}

impl FlowKey {
    /// Key for a TCP flow originating at `src`
    #[must_use]
    pub fn tcp(src: SocketAddr) -> Self {
        Self {
            addr: src.ip(),
            port: src.port(),
            proto: 6,
        }
    }
}

/// One connection-tracking event
#[derive(Debug, Clone, Copy)]
pub enum FlowEvent {
    /// A flow was created or confirmed; `timeout` is the kernel's remaining
    /// lifetime for the entry when the event carried one
    Established {
        key: FlowKey,
        dest: SocketAddr,
        timeout: Option<Duration>,
    },
    /// A flow left the kernel table
    Destroyed { key: FlowKey },
}

impl FlowEvent {
    /// The key this event applies to
    #[must_use]
    pub const fn key(&self) -> &FlowKey {
        match self {
            Self::Established { key, .. } | Self::Destroyed { key } => key,
        }
    }
}

/// Non-blocking producer handle with an overflow counter
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<FlowEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Create a bounded event channel
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<FlowEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Offer an event; drops it when the channel is full or closed.
    pub fn send(&self, event: FlowEvent) {
        if self.tx.try_send(event).is_err() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total.is_power_of_two() {
                warn!(total, "Flow event channel full, dropping events");
            }
        }
    }

    /// Total events dropped so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
