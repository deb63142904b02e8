//! rust-divert: split-horizon traffic diversion for Linux gateways
//!
//! Classifies destinations against gfwlist-style rule documents and steers
//! matched traffic into a local tunnel transport, leaving everything else
//! on the direct path.
//!
//! # Architecture
//!
//! ```text
//! LAN client ── DNS query ──▶ split resolver ──▶ forward resolver (direct)
//!                               │                tunneled resolver (matched)
//!                               └─ matched A answers ──▶ ipset
//!
//! LAN client ── TCP ──▶ iptables DNAT (set match) ──▶ proxy listener
//!                                                        │
//!            conntrack events ──▶ flow tracker ──────────┤ original dest
//!                                                        ▼
//!                                             relay CONNECT over tunnel
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types, loading, interface discovery
//! - [`rules`]: Rule document parsing and the hot-swappable classifier
//! - [`flow`]: Conntrack event source and the flow destination table
//! - [`dns`]: Split-horizon resolver, answer cache, upstream clients
//! - [`relay`]: Tunnel signaling codec (SOCKS5 subset)
//! - [`proxy`]: Intercepted-connection relay
//! - [`firewall`]: iptables/ipset rule lifecycle
//! - [`error`]: Error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod dns;
pub mod error;
pub mod firewall;
pub mod flow;
pub mod proxy;
pub mod relay;
pub mod rules;

// Re-export commonly used types at the crate root
pub use config::{load_config, load_config_with_env, Config};
pub use dns::{AnswerCache, DirectResolver, DnsServer, RemoteResolver, SplitResolver};
pub use error::{
    ConfigError, DivertError, DnsError, FirewallError, FlowError, RelayError, Result, RuleError,
};
pub use firewall::Firewall;
pub use flow::{EventSender, FlowEvent, FlowKey, FlowTracker};
pub use proxy::{StreamSession, TcpSession};
pub use relay::RelayAddress;
pub use rules::{Classifier, ClassifierSnapshot, RuleSet};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
