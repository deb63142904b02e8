//! Relay signaling (RFC 1928 subset)
//!
//! The binary handshake spoken on both ends of the tunnel to carry the
//! real destination of a stream. Only the parts the diverter needs exist:
//! no authentication methods beyond "none", no BIND, and a fixed-format
//! success reply on CONNECT (the initiator validates it byte-for-byte
//! rather than parsing a general reply).
//!
//! [`addr`] is the address record codec, [`acceptor`] the server role that
//! the tunnel peer runs, [`initiator`] the client role this daemon uses on
//! freshly opened tunnel streams.

pub mod acceptor;
pub mod addr;
pub mod initiator;

pub use acceptor::{accept_handshake, Handshake};
pub use addr::RelayAddress;
pub use initiator::{read_connect_response, send_connect_request};

/// Protocol version (RFC 1928)
pub const SOCKS_VERSION: u8 = 0x05;

/// "No authentication" method
pub const AUTH_METHOD_NONE: u8 = 0x00;

/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;

/// UDP ASSOCIATE command
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// IPv4 address record tag
pub const ATYP_IPV4: u8 = 0x01;

/// Domain address record tag
pub const ATYP_DOMAIN: u8 = 0x03;

/// IPv6 address record tag
pub const ATYP_IPV6: u8 = 0x04;

/// Negotiation reply: version 5, method "none"
pub const NEGOTIATION_REPLY: [u8; 2] = [SOCKS_VERSION, AUTH_METHOD_NONE];

/// The fixed CONNECT success frame: VER REP RSV ATYP(IPv4) 0.0.0.0:0
pub const CONNECT_SUCCESS_REPLY: [u8; 10] = [SOCKS_VERSION, 0, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

/// Largest encoded address record: tag + len + 255-byte domain + port
pub const MAX_ADDR_LEN: usize = 1 + 1 + 255 + 2;
