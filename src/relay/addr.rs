//! Address record codec (RFC 1928 section 5)
//!
//! Wire format: a one-byte type tag, the address body (4 bytes, 16 bytes,
//! or a length-prefixed domain), then a 2-byte big-endian port.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use crate::error::RelayError;

/// A destination as carried in relay signaling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAddress {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl RelayAddress {
    /// The port component
    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            Self::V4(_, port) | Self::V6(_, port) | Self::Domain(_, port) => *port,
        }
    }

    /// Read one address record from `reader`
    ///
    /// # Errors
    ///
    /// Returns `RelayError::UnsupportedAddressType` for an unknown tag,
    /// `RelayError::InvalidDomainName` for non-UTF-8 domain bytes, and
    /// `RelayError::IoError` for short reads.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, RelayError>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = reader.read_u8().await?;
        match atyp {
            ATYP_IPV4 => {
                let mut body = [0u8; 6];
                reader.read_exact(&mut body).await?;
                let addr = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let port = u16::from_be_bytes([body[4], body[5]]);
                Ok(Self::V4(addr, port))
            }
            ATYP_IPV6 => {
                let mut body = [0u8; 18];
                reader.read_exact(&mut body).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                let port = u16::from_be_bytes([body[16], body[17]]);
                Ok(Self::V6(Ipv6Addr::from(octets), port))
            }
            ATYP_DOMAIN => {
                let len = usize::from(reader.read_u8().await?);
                let mut body = vec![0u8; len + 2];
                reader.read_exact(&mut body).await?;
                let port = u16::from_be_bytes([body[len], body[len + 1]]);
                let domain = String::from_utf8(body[..len].to_vec())
                    .map_err(|_| RelayError::InvalidDomainName)?;
                Ok(Self::Domain(domain, port))
            }
            other => Err(RelayError::UnsupportedAddressType(other)),
        }
    }

    /// Append the wire encoding to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Self::V4(addr, port) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&addr.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Self::V6(addr, port) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&addr.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Self::Domain(domain, port) => {
                buf.push(ATYP_DOMAIN);
                // Domains longer than 255 bytes cannot be encoded; they do
                // not occur in DNS and are truncated defensively here.
                let len = domain.len().min(255);
                buf.push(len as u8);
                buf.extend_from_slice(&domain.as_bytes()[..len]);
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    /// The wire encoding as a fresh buffer
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(super::MAX_ADDR_LEN);
        self.encode_into(&mut buf);
        buf
    }

    /// Write the wire encoding to `writer`
    ///
    /// # Errors
    ///
    /// Returns `RelayError::IoError` on transport failure.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()).await?;
        Ok(())
    }
}

impl From<SocketAddr> for RelayAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Self::V4(ip, addr.port()),
            IpAddr::V6(ip) => Self::V6(ip, addr.port()),
        }
    }
}

impl fmt::Display for RelayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(addr, port) => write!(f, "{addr}:{port}"),
            Self::V6(addr, port) => write!(f, "[{addr}]:{port}"),
            Self::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}
