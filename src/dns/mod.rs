//! Split-horizon DNS
//!
//! The resolver half of the traffic diverter. Queries arrive over UDP or
//! TCP, are classified against the rule lists, and resolve either directly
//! ([`forward`]) or through the tunnel's resolver pool ([`upstream`]).
//! Answers live in a TTL cache ([`cache`]) whose expirations drive
//! background refresh, and tunneled answers feed the firewall's redirect
//! set before they are returned.

pub mod cache;
pub mod forward;
pub mod server;
pub mod upstream;

pub use cache::{AnswerCache, CacheKey, RefreshTicket};
pub use forward::DirectResolver;
pub use server::{spawn_refresh_worker, DnsServer, SplitResolver};
pub use upstream::RemoteResolver;
