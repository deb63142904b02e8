//! Connection flow tracking
//!
//! Recovers the original destination of transparently redirected TCP
//! connections. The kernel's connection-tracking table is the source of
//! truth: its events flow through a bounded channel into a TTL-bounded
//! in-process table keyed by source tuple, which the proxy consults when a
//! redirected connection arrives.
//!
//! The event source ([`conntrack`]) is Linux-only; the table and event
//! model are portable and fully testable without a kernel.

#[cfg(target_os = "linux")]
pub mod conntrack;
pub mod event;
pub mod tracker;

#[cfg(target_os = "linux")]
pub use conntrack::ConntrackSource;
pub use event::{EventSender, FlowEvent, FlowKey};
pub use tracker::{FlowFilter, FlowStatsSnapshot, FlowTracker};
