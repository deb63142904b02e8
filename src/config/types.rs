//! Configuration types for rust-divert
//!
//! Configuration is loaded from JSON files and validated at startup. The
//! surface mirrors what the daemon needs to wire together: rule list sources,
//! the split-horizon DNS addresses, the remote query pool sizing, and the
//! firewall/interception parameters.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Rule list sources and overrides
    pub rules: RulesConfig,

    /// Split-horizon DNS settings
    pub dns: DnsConfig,

    /// Intercepted-connection proxy settings
    pub proxy: ProxyConfig,

    /// Firewall provisioning settings
    #[serde(default)]
    pub firewall: FirewallConfig,

    /// Flow tracker settings
    #[serde(default)]
    pub flow: FlowConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rules.validate()?;
        self.dns.validate()?;
        self.proxy.validate()?;
        self.flow.validate()?;
        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            rules: RulesConfig::default(),
            dns: DnsConfig::default(),
            proxy: ProxyConfig::default(),
            firewall: FirewallConfig::default(),
            flow: FlowConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Rule list sources
///
/// At least one tunnel-list source (URL or file) must be configured. Sources
/// are fetched at startup and on reload; fetch failure at startup is fatal.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RulesConfig {
    /// Remote tunnel-list URLs (base64-wrapped gfwlist documents accepted)
    #[serde(default)]
    pub list_urls: Vec<String>,

    /// Local tunnel-list files
    #[serde(default)]
    pub list_files: Vec<PathBuf>,

    /// Local user-block list files (evaluated before the tunnel list;
    /// matching names are answered empty and never resolved)
    #[serde(default)]
    pub block_files: Vec<PathBuf>,
}

impl RulesConfig {
    /// Validate rules configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.list_urls.is_empty() && self.list_files.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one rule list source (list_urls or list_files) must be configured".into(),
            ));
        }
        for url in &self.list_urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::ValidationError(format!(
                    "Rule list URL must be http(s): {url}"
                )));
            }
        }
        Ok(())
    }
}

/// Split-horizon DNS settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// Local listener address for the DNS server (UDP and TCP)
    #[serde(default = "default_dns_listen")]
    pub listen: SocketAddr,

    /// Forward resolver for the direct path (UDP)
    #[serde(default = "default_forward_resolver")]
    pub forward_resolver: SocketAddr,

    /// Tunneled resolver for the remote path (DNS over TCP through the
    /// tunnel's local endpoint)
    #[serde(default = "default_remote_resolver")]
    pub remote_resolver: SocketAddr,

    /// Answer cache TTL in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Maximum persistent connections to the remote resolver
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Remote queries per second (0 = same as pool_size)
    #[serde(default)]
    pub queries_per_second: u32,

    /// Rate limiter burst allowance
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Exchange timeout in seconds for a single attempt
    #[serde(default = "default_exchange_timeout_secs")]
    pub exchange_timeout_secs: u64,

    /// Answer every name through the forward resolver, never the tunnel.
    /// For running as a plain caching resolver without the proxy path.
    #[serde(default)]
    pub listener_only: bool,
}

impl DnsConfig {
    /// Validate DNS configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "dns.pool_size must be at least 1".into(),
            ));
        }
        if self.burst == 0 {
            return Err(ConfigError::ValidationError(
                "dns.burst must be at least 1".into(),
            ));
        }
        if self.cache_ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "dns.cache_ttl_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Effective queries-per-second (defaults to the pool size)
    #[must_use]
    pub fn effective_qps(&self) -> u32 {
        if self.queries_per_second == 0 {
            u32::try_from(self.pool_size).unwrap_or(u32::MAX)
        } else {
            self.queries_per_second
        }
    }

    /// Cache TTL as a `Duration`
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Per-attempt exchange timeout as a `Duration`
    #[must_use]
    pub const fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen: default_dns_listen(),
            forward_resolver: default_forward_resolver(),
            remote_resolver: default_remote_resolver(),
            cache_ttl_secs: default_cache_ttl_secs(),
            pool_size: default_pool_size(),
            queries_per_second: 0,
            burst: default_burst(),
            exchange_timeout_secs: default_exchange_timeout_secs(),
            listener_only: false,
        }
    }
}

/// Intercepted-connection proxy settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Listener the firewall redirects matched connections to
    #[serde(default = "default_proxy_listen")]
    pub listen: SocketAddr,

    /// Local endpoint of the tunnel transport (one TCP connection per
    /// stream; the transport itself is outside this daemon)
    #[serde(default = "default_tunnel_addr")]
    pub tunnel_addr: SocketAddr,

    /// Accept UDP-ASSOCIATE requests on the relay acceptor
    #[serde(default)]
    pub udp_associate: bool,

    /// Also host the far-side relay acceptor on this address (loopback
    /// single-host setups and testing)
    #[serde(default)]
    pub acceptor_listen: Option<SocketAddr>,
}

impl ProxyConfig {
    /// Validate proxy configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen == self.tunnel_addr {
            return Err(ConfigError::ValidationError(
                "proxy.listen and proxy.tunnel_addr must differ".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_proxy_listen(),
            tunnel_addr: default_tunnel_addr(),
            udp_associate: false,
            acceptor_listen: None,
        }
    }
}

/// Firewall provisioning settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FirewallConfig {
    /// Manage iptables/ipset rules (disable for userspace-only testing)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Egress interface name for the MASQUERADE rule; also the interface
    /// whose subnet is treated as local by the flow tracker
    #[serde(default = "default_ifname")]
    pub interface: String,

    /// iptables binary
    #[serde(default = "default_iptables_bin")]
    pub iptables_bin: String,

    /// ipset binary
    #[serde(default = "default_ipset_bin")]
    pub ipset_bin: String,

    /// Name of the blocked-destination IP set
    #[serde(default = "default_set_name")]
    pub set_name: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interface: default_ifname(),
            iptables_bin: default_iptables_bin(),
            ipset_bin: default_ipset_bin(),
            set_name: default_set_name(),
        }
    }
}

/// Flow tracker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowConfig {
    /// Event channel capacity; events arriving while full are dropped
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Fallback entry TTL in seconds when an event carries no timeout
    #[serde(default = "default_flow_ttl_secs")]
    pub fallback_ttl_secs: u64,

    /// Sweep interval for expired entries, in seconds
    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,
}

impl FlowConfig {
    /// Validate flow configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "flow.event_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Fallback TTL as a `Duration`
    #[must_use]
    pub const fn fallback_ttl(&self) -> Duration {
        Duration::from_secs(self.fallback_ttl_secs)
    }

    /// Sweep interval as a `Duration`
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            fallback_ttl_secs: default_flow_ttl_secs(),
            sweep_interval_secs: default_sweep_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output JSON-formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_dns_listen() -> SocketAddr {
    "127.0.0.1:5353".parse().unwrap()
}

fn default_forward_resolver() -> SocketAddr {
    "223.5.5.5:53".parse().unwrap()
}

fn default_remote_resolver() -> SocketAddr {
    "127.0.0.1:10053".parse().unwrap()
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_pool_size() -> usize {
    8
}

fn default_burst() -> u32 {
    1
}

fn default_exchange_timeout_secs() -> u64 {
    5
}

fn default_proxy_listen() -> SocketAddr {
    "127.0.0.1:12948".parse().unwrap()
}

fn default_tunnel_addr() -> SocketAddr {
    "127.0.0.1:12984".parse().unwrap()
}

fn default_ifname() -> String {
    "eth0".into()
}

fn default_iptables_bin() -> String {
    "iptables".into()
}

fn default_ipset_bin() -> String {
    "ipset".into()
}

fn default_set_name() -> String {
    "divertlist".into()
}

fn default_event_capacity() -> usize {
    1024
}

fn default_flow_ttl_secs() -> u64 {
    120
}

fn default_sweep_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default_config();
        config.rules.list_files.push("/etc/divert/gfwlist.txt".into());
        config
    }

    #[test]
    fn test_default_config_needs_rule_source() {
        let config = Config::default_config();
        assert!(config.validate().is_err());
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_rule_url_scheme_validation() {
        let mut config = valid_config();
        config.rules.list_urls.push("ftp://example.com/list".into());
        assert!(config.validate().is_err());

        config.rules.list_urls.clear();
        config
            .rules
            .list_urls
            .push("https://example.com/gfwlist.txt".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_qps_defaults_to_pool_size() {
        let dns = DnsConfig::default();
        assert_eq!(dns.effective_qps(), dns.pool_size as u32);

        let dns = DnsConfig {
            queries_per_second: 20,
            ..DnsConfig::default()
        };
        assert_eq!(dns.effective_qps(), 20);
    }

    #[test]
    fn test_pool_size_zero_rejected() {
        let mut config = valid_config();
        config.dns.pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_listen_tunnel_collision_rejected() {
        let mut config = valid_config();
        config.proxy.tunnel_addr = config.proxy.listen;
        assert!(config.validate().is_err());
    }
}
