//! Error types for rust-divert
//!
//! Errors are categorized by subsystem. Configuration and rule-source errors
//! are fatal at construction; transient resource errors (pool exhaustion,
//! flow-lookup miss) are recovered locally by the caller; protocol errors
//! terminate only the connection that produced them.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for rust-divert
#[derive(Debug, Error)]
pub enum DivertError {
    /// Configuration errors (parsing, validation, interface discovery)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Rule list compilation and source errors
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// Flow tracker errors
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    /// DNS resolution and server errors
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// Relay signaling protocol errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Firewall provisioning errors
    #[error("Firewall error: {0}")]
    Firewall(#[from] FirewallError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DivertError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Rule(_) => false,
            Self::Flow(e) => e.is_recoverable(),
            Self::Dns(e) => e.is_recoverable(),
            Self::Relay(e) => e.is_recoverable(),
            Self::Firewall(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Invalid address (malformed host:port)
    #[error("Invalid address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// Network interface lookup failure
    #[error("Interface {ifname}: {reason}")]
    Interface { ifname: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors require user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create an invalid address error
    pub fn invalid_address(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    /// Create an interface error
    pub fn interface(ifname: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Interface {
            ifname: ifname.into(),
            reason: reason.into(),
        }
    }
}

/// Rule list errors
///
/// A missing or unreadable list source at startup is fatal: the classifier
/// cannot operate without rules. A malformed regex inside an otherwise valid
/// document is *not* an error; it is logged and the rule never matches.
#[derive(Debug, Error)]
pub enum RuleError {
    /// Remote list fetch failed
    #[error("Failed to fetch rule list from {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// Remote list returned a non-success status
    #[error("Rule list {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    /// Local list file unreadable
    #[error("Failed to read rule file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl RuleError {
    /// Create a fetch error
    pub fn fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Flow tracker errors
#[derive(Debug, Error)]
pub enum FlowError {
    /// Failed to open the kernel event source
    #[error("Failed to open conntrack event socket: {0}")]
    EventSource(String),

    /// Event stream terminated
    #[error("Conntrack event stream closed")]
    StreamClosed,
}

impl FlowError {
    /// Event-source failures at startup are fatal; a closed stream is not
    /// (the consumer task exits and lookups degrade to "not found").
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::StreamClosed)
    }
}

/// DNS resolution and server errors
#[derive(Debug, Error)]
pub enum DnsError {
    /// Failed to bind a listener socket
    #[error("Failed to bind DNS listener on {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// Malformed wire message
    #[error("Failed to decode DNS message: {0}")]
    Decode(String),

    /// Failed to encode a response
    #[error("Failed to encode DNS message: {0}")]
    Encode(String),

    /// Upstream exchange failed (transport-level)
    #[error("DNS exchange with {server} failed: {reason}")]
    Exchange { server: SocketAddr, reason: String },

    /// Upstream answered with a non-success response code
    #[error("Upstream {server} answered {rcode}")]
    UpstreamRcode { server: SocketAddr, rcode: String },

    /// All pooled connections are in use and the pool is at capacity
    #[error("Remote query pool exhausted ({max} connections)")]
    PoolExhausted { max: usize },

    /// I/O error
    #[error("DNS I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl DnsError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Bind { .. } | Self::Decode(_) | Self::Encode(_) => false,
            Self::Exchange { .. } | Self::UpstreamRcode { .. } | Self::PoolExhausted { .. } => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create an exchange error
    pub fn exchange(server: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Exchange {
            server,
            reason: reason.into(),
        }
    }
}

/// Relay signaling protocol errors (RFC 1928 subset)
///
/// These terminate only the single stream involved.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Peer sent a protocol version other than 0x05
    #[error("Unsupported relay protocol version: {0:#04x}")]
    BadVersion(u8),

    /// Unknown address type tag in an address record
    #[error("Unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Command other than CONNECT / UDP-ASSOCIATE
    #[error("Command not supported: {0:#04x}")]
    CommandNotSupported(u8),

    /// Domain name bytes were not valid UTF-8
    #[error("Invalid domain name in address record")]
    InvalidDomainName,

    /// The fixed-format success reply did not match
    #[error("Relay peer rejected connect request")]
    ConnectRejected,

    /// Failed to dial the requested target
    #[error("Failed to connect to {target}: {reason}")]
    DialFailed { target: String, reason: String },

    /// Truncated record or transport failure mid-handshake
    #[error("Relay I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl RelayError {
    /// Protocol violations are never retried on the same stream; dial and
    /// transport failures may be retried by opening a new stream.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::DialFailed { .. } | Self::IoError(_))
    }

    /// Create a dial failure error
    pub fn dial_failed(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DialFailed {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

/// Firewall provisioning errors
#[derive(Debug, Error)]
pub enum FirewallError {
    /// An external tool exited non-zero; output captured for the operator
    #[error("{program} {args} failed: {output}")]
    CommandFailed {
        program: String,
        args: String,
        output: String,
    },

    /// The tool binary could not be spawned at all
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl FirewallError {
    /// Install failures are fatal by policy; set-add failures are logged
    /// and retried on the next resolution of the same name.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Type alias for Result with `DivertError`
pub type Result<T> = std::result::Result<T, DivertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recovery_classification() {
        let config_err = ConfigError::ValidationError("test".into());
        assert!(!config_err.is_recoverable());

        let pool_err = DnsError::PoolExhausted { max: 8 };
        assert!(pool_err.is_recoverable());

        let bind_err = DnsError::Bind {
            addr: "127.0.0.1:53".parse().unwrap(),
            reason: "permission denied".into(),
        };
        assert!(!bind_err.is_recoverable());

        let relay_err = RelayError::UnsupportedAddressType(0x09);
        assert!(!relay_err.is_recoverable());

        let dial_err = RelayError::dial_failed("example.com:443", "refused");
        assert!(dial_err.is_recoverable());

        assert!(FlowError::StreamClosed.is_recoverable());
        assert!(!FlowError::EventSource("EPERM".into()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = RelayError::UnsupportedAddressType(0x09);
        assert!(err.to_string().contains("0x09"));

        let err = DnsError::exchange("10.0.0.1:53".parse().unwrap(), "connection reset");
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.1:53"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let err: DivertError = io_err.into();
        assert!(err.is_recoverable());

        let rule_err = RuleError::fetch("https://example.com/list", "dns failure");
        let err: DivertError = rule_err.into();
        assert!(!err.is_recoverable());
    }
}
