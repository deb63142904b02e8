//! Configuration module for rust-divert
//!
//! This module provides configuration types, loading utilities, and network
//! interface discovery.
//!
//! # Example
//!
//! ```no_run
//! use rust_divert::config::{load_config, Config};
//!
//! let config = load_config("/etc/rust-divert/config.json").unwrap();
//! println!("DNS listener: {}", config.dns.listen);
//! ```

mod loader;
mod netif;
mod types;

pub use loader::{load_config, load_config_str, load_config_with_env};
pub use netif::{interface_addr, interface_subnet};
pub use types::{
    Config, DnsConfig, FirewallConfig, FlowConfig, LogConfig, ProxyConfig, RulesConfig,
};
