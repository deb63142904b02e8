//! Acceptor role of the relay handshake
//!
//! Runs on the far side of the tunnel: reads the negotiation and request,
//! and for CONNECT dials the requested target and hands both streams back
//! to the caller for relaying. UDP ASSOCIATE is an opt-in sentinel outcome,
//! answered with the local endpoint; anything else is a protocol error
//! that costs only this stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::addr::RelayAddress;
use super::{CMD_CONNECT, CMD_UDP_ASSOCIATE, CONNECT_SUCCESS_REPLY, NEGOTIATION_REPLY, SOCKS_VERSION};
use crate::error::RelayError;

/// Outcome of an accepted handshake
pub enum Handshake {
    /// CONNECT accepted: the dialed target connection, ready for relaying
    Connect {
        target: RelayAddress,
        conn: TcpStream,
    },
    /// UDP ASSOCIATE accepted and answered; the stream must be held open
    /// but carries no payload
    UdpAssociate,
}

/// Serve one handshake on `stream`.
///
/// `local_addr` is this end's address, reported in the UDP ASSOCIATE reply;
/// `udp_enabled` gates that command.
///
/// # Errors
///
/// Returns `RelayError` on protocol violations, transport failures, or a
/// failed dial to the requested target.
pub async fn accept_handshake<S>(
    stream: &mut S,
    local_addr: std::net::SocketAddr,
    udp_enabled: bool,
) -> Result<Handshake, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // VER, NMETHODS, then the method list we ignore
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(RelayError::BadVersion(head[0]));
    }
    let mut methods = vec![0u8; usize::from(head[1])];
    stream.read_exact(&mut methods).await?;

    stream.write_all(&NEGOTIATION_REPLY).await?;

    // VER CMD RSV, then the address record
    let mut request = [0u8; 3];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(RelayError::BadVersion(request[0]));
    }
    let cmd = request[1];
    let target = RelayAddress::read_from(stream).await?;

    match cmd {
        CMD_CONNECT => {
            stream.write_all(&CONNECT_SUCCESS_REPLY).await?;

            let conn = TcpStream::connect(target.to_string())
                .await
                .map_err(|e| RelayError::dial_failed(target.to_string(), e.to_string()))?;

            info!(target = %target, "Relay connected");
            Ok(Handshake::Connect { target, conn })
        }
        CMD_UDP_ASSOCIATE => {
            if !udp_enabled {
                return Err(RelayError::CommandNotSupported(cmd));
            }

            // VER REP RSV + our endpoint as the relay address
            let mut reply = vec![SOCKS_VERSION, 0, 0];
            RelayAddress::from(local_addr).encode_into(&mut reply);
            stream.write_all(&reply).await?;

            debug!(%local_addr, "UDP associate acknowledged");
            Ok(Handshake::UdpAssociate)
        }
        other => Err(RelayError::CommandNotSupported(other)),
    }
}
