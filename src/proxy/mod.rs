//! Intercepted-connection proxy
//!
//! The listener the firewall's match-set DNAT points at. Every accepted
//! connection gets a fresh tunnel stream; the flow tracker recovers the
//! connection's original destination, which is signaled to the tunnel peer
//! with a relay CONNECT before payload bytes flow. When the tracker has no
//! answer (events raced or were dropped) the connection is still relayed,
//! just without the destination signal, and the peer falls back to its own
//! default.
//!
//! The tunnel transport itself is out of scope and hidden behind
//! [`StreamSession`]; the default [`TcpSession`] opens one TCP connection
//! to the transport's local endpoint per stream.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::flow::{FlowKey, FlowTracker};
use crate::relay::{read_connect_response, send_connect_request, RelayAddress};

/// An ordered byte stream through the tunnel
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

/// Source of tunnel streams, one per intercepted connection
#[async_trait]
pub trait StreamSession: Send + Sync {
    /// Open a fresh stream to the tunnel peer
    async fn open_stream(&self) -> io::Result<Box<dyn TunnelStream>>;
}

/// Degenerate session: one TCP connection to the transport endpoint per
/// stream
pub struct TcpSession {
    tunnel_addr: SocketAddr,
}

impl TcpSession {
    #[must_use]
    pub const fn new(tunnel_addr: SocketAddr) -> Self {
        Self { tunnel_addr }
    }
}

#[async_trait]
impl StreamSession for TcpSession {
    async fn open_stream(&self) -> io::Result<Box<dyn TunnelStream>> {
        let stream = TcpStream::connect(self.tunnel_addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Accept intercepted connections until cancelled
pub async fn run_proxy(
    listener: TcpListener,
    tracker: Option<Arc<FlowTracker>>,
    session: Arc<dyn StreamSession>,
) {
    info!(
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        "Proxy listener started"
    );

    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Proxy accept failed");
                continue;
            }
        };

        let tracker = tracker.clone();
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(e) = handle_intercepted(conn, peer, tracker.as_deref(), &*session).await {
                debug!(%peer, error = %e, "Intercepted connection ended");
            }
        });
    }
}

/// Host the far-side relay acceptor: serve handshakes and relay accepted
/// CONNECT streams to their dialed targets
pub async fn run_acceptor(listener: TcpListener, udp_enabled: bool) {
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, "Acceptor listener has no local address");
            return;
        }
    };
    info!(addr = %local_addr, "Relay acceptor started");

    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Acceptor accept failed");
                continue;
            }
        };

        tokio::spawn(async move {
            match crate::relay::accept_handshake(&mut stream, local_addr, udp_enabled).await {
                Ok(crate::relay::Handshake::Connect { mut conn, .. }) => {
                    let _ = tokio::io::copy_bidirectional(&mut stream, &mut conn).await;
                }
                Ok(crate::relay::Handshake::UdpAssociate) => {
                    // Hold the control stream open until the peer closes it.
                    let mut sink = [0u8; 64];
                    use tokio::io::AsyncReadExt;
                    while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                }
                Err(e) => {
                    debug!(%peer, error = %e, "Relay handshake failed");
                }
            }
        });
    }
}

/// Relay one intercepted connection over a fresh tunnel stream
pub async fn handle_intercepted(
    mut conn: TcpStream,
    peer: SocketAddr,
    tracker: Option<&FlowTracker>,
    session: &dyn StreamSession,
) -> io::Result<()> {
    let mut stream = session.open_stream().await?;

    if let Some(tracker) = tracker {
        let key = FlowKey::tcp(peer);
        match tracker.lookup_retrying(&key).await {
            Some(dest) => {
                debug!(%peer, %dest, "Signaling recovered destination");
                let target = RelayAddress::from(dest);
                send_connect_request(&mut stream, &target)
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                read_connect_response(&mut stream)
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            }
            None => {
                warn!(%peer, "No tracked flow, relaying without destination signal");
            }
        }
    }

    let (up, down) = tokio::io::copy_bidirectional(&mut conn, &mut stream).await?;
    debug!(%peer, up, down, "Relay finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{accept_handshake, Handshake, CONNECT_SUCCESS_REPLY};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Session handing out pre-created in-memory streams
    struct DuplexSession {
        streams: Mutex<Vec<DuplexStream>>,
    }

    impl DuplexSession {
        fn with_peers(count: usize) -> (Arc<Self>, Vec<DuplexStream>) {
            let mut ours = Vec::new();
            let mut theirs = Vec::new();
            for _ in 0..count {
                let (a, b) = tokio::io::duplex(4096);
                ours.push(a);
                theirs.push(b);
            }
            (
                Arc::new(Self {
                    streams: Mutex::new(ours),
                }),
                theirs,
            )
        }
    }

    #[async_trait]
    impl StreamSession for DuplexSession {
        async fn open_stream(&self) -> io::Result<Box<dyn TunnelStream>> {
            self.streams
                .lock()
                .pop()
                .map(|s| Box::new(s) as Box<dyn TunnelStream>)
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no streams left"))
        }
    }

    async fn connected_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let peer = client.local_addr().unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        (client, server_side, peer)
    }

    #[tokio::test]
    async fn test_signals_recovered_destination() {
        let (mut client, server_side, peer) = connected_pair().await;
        let (session, mut peers) = DuplexSession::with_peers(1);
        let mut tunnel_peer = peers.pop().unwrap();

        let tracker = FlowTracker::new(vec![], Duration::from_secs(60));
        tracker.apply(&crate::flow::FlowEvent::Established {
            key: FlowKey::tcp(peer),
            dest: "93.184.216.34:443".parse().unwrap(),
            timeout: None,
        });

        let relay = tokio::spawn(async move {
            handle_intercepted(server_side, peer, Some(&tracker), &*session).await
        });

        // Tunnel peer: read negotiation + CONNECT, validate the carried
        // destination, answer with the fixed reply.
        let mut head = [0u8; 6];
        tunnel_peer.read_exact(&mut head).await.unwrap();
        assert_eq!(head, [0x05, 0x01, 0x00, 0x05, 0x01, 0x00]);
        let target = RelayAddress::read_from(&mut tunnel_peer).await.unwrap();
        assert_eq!(target.to_string(), "93.184.216.34:443");

        let mut reply = vec![0x05, 0x00];
        reply.extend_from_slice(&CONNECT_SUCCESS_REPLY);
        tunnel_peer.write_all(&reply).await.unwrap();

        // Payload flows after the handshake.
        client.write_all(b"ping").await.unwrap();
        let mut payload = [0u8; 4];
        tunnel_peer.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"ping");

        drop(client);
        drop(tunnel_peer);
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_flow_relays_without_signal() {
        let (mut client, server_side, peer) = connected_pair().await;
        let (session, mut peers) = DuplexSession::with_peers(1);
        let mut tunnel_peer = peers.pop().unwrap();

        // Empty tracker: lookup misses after its retries.
        let tracker = FlowTracker::new(vec![], Duration::from_secs(60));

        let relay = tokio::spawn(async move {
            handle_intercepted(server_side, peer, Some(&tracker), &*session).await
        });

        // First bytes on the tunnel are raw payload, not a handshake.
        client.write_all(b"raw payload").await.unwrap();
        let mut payload = [0u8; 11];
        tunnel_peer.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"raw payload");

        drop(client);
        drop(tunnel_peer);
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_with_acceptor() {
        // Origin server the acceptor will dial.
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            conn.write_all(b"world").await.unwrap();
        });

        let (mut client, server_side, peer) = connected_pair().await;
        let (session, mut peers) = DuplexSession::with_peers(1);
        let mut tunnel_peer = peers.pop().unwrap();

        let tracker = FlowTracker::new(vec![], Duration::from_secs(60));
        tracker.apply(&crate::flow::FlowEvent::Established {
            key: FlowKey::tcp(peer),
            dest: origin_addr,
            timeout: None,
        });

        // The far side of the tunnel runs the acceptor and then relays.
        let far_side = tokio::spawn(async move {
            let handshake =
                accept_handshake(&mut tunnel_peer, "127.0.0.1:1080".parse().unwrap(), false)
                    .await
                    .unwrap();
            match handshake {
                Handshake::Connect { mut conn, .. } => {
                    let _ = tokio::io::copy_bidirectional(&mut tunnel_peer, &mut conn).await;
                }
                Handshake::UdpAssociate => panic!("expected connect"),
            }
        });

        let relay = tokio::spawn(async move {
            handle_intercepted(server_side, peer, Some(&tracker), &*session).await
        });

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client);
        let _ = relay.await.unwrap();
        let _ = far_side.await;
    }
}
