//! Initiator role of the relay handshake
//!
//! Spoken on a freshly opened tunnel stream before any payload: a
//! negotiation offering only "no auth", a CONNECT request carrying the
//! recovered destination, and a strict check of the peer's reply. The two
//! negotiation reply bytes and the ten-byte success frame are read in one
//! piece and compared byte-for-byte; anything else fails the stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::addr::RelayAddress;
use super::{AUTH_METHOD_NONE, CMD_CONNECT, CONNECT_SUCCESS_REPLY, SOCKS_VERSION};
use crate::error::RelayError;

/// Send the negotiation and CONNECT request for `target`
///
/// # Errors
///
/// Returns `RelayError::IoError` on transport failure.
pub async fn send_connect_request<W>(
    writer: &mut W,
    target: &RelayAddress,
) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    // VER, NMETHODS=1, METHOD=none
    writer
        .write_all(&[SOCKS_VERSION, 0x01, AUTH_METHOD_NONE])
        .await?;

    // VER CMD RSV + address record
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    target.encode_into(&mut request);
    writer.write_all(&request).await?;

    debug!(target = %target, "Sent relay connect request");
    Ok(())
}

/// Read and validate the peer's combined reply: the negotiation reply
/// followed by the fixed success frame, twelve bytes total.
///
/// # Errors
///
/// Returns `RelayError::ConnectRejected` when the bytes do not match the
/// expected sequence, or `RelayError::IoError` on a short read.
pub async fn read_connect_response<R>(reader: &mut R) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut reply = [0u8; 2 + CONNECT_SUCCESS_REPLY.len()];
    reader.read_exact(&mut reply).await?;

    if reply[2..] != CONNECT_SUCCESS_REPLY {
        return Err(RelayError::ConnectRejected);
    }

    debug!("Relay connect accepted");
    Ok(())
}
