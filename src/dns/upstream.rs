//! Remote query pool
//!
//! Persistent DNS-over-TCP connections to the tunneled resolver. The pool
//! is bounded: a connection is either free or checked out by exactly one
//! exchange, and at most `max_conns` exist at a time. A token-bucket rate
//! limiter gates every resolve before a connection is even requested, so
//! a resolve may park on the limiter but never busy-spins on the pool.
//!
//! Failed connections are closed and forgotten, never returned to the
//! pool; the next acquire dials a replacement.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use hickory_proto::op::{Message, ResponseCode};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::DnsError;

/// Attempts per resolve before giving up
const EXCHANGE_ATTEMPTS: u32 = 3;

/// Pause after finding the pool exhausted
const EXHAUSTED_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Largest DNS-over-TCP message we will read
const MAX_TCP_MESSAGE_SIZE: usize = 65_535;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Default)]
struct PoolStats {
    dialed: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
    exhausted: AtomicU64,
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy)]
pub struct PoolStatsSnapshot {
    pub dialed: u64,
    pub reused: u64,
    pub discarded: u64,
    pub exhausted: u64,
}

struct PoolState {
    free: Vec<TcpStream>,
    /// Connections in existence, free or checked out
    live: usize,
}

/// Rate-limited pool of DNS-over-TCP connections to one resolver
pub struct RemoteResolver {
    server: SocketAddr,
    state: Mutex<PoolState>,
    limiter: DirectRateLimiter,
    max_conns: usize,
    exchange_timeout: Duration,
    stats: PoolStats,
}

impl RemoteResolver {
    /// Create a pool for `server` with the given bound and rate
    ///
    /// `qps` and `burst` are clamped to at least 1.
    #[must_use]
    pub fn new(
        server: SocketAddr,
        max_conns: usize,
        qps: u32,
        burst: u32,
        exchange_timeout: Duration,
    ) -> Self {
        let qps = NonZeroU32::new(qps).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        Self {
            server,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                live: 0,
            }),
            limiter: RateLimiter::direct(Quota::per_second(qps).allow_burst(burst)),
            max_conns: max_conns.max(1),
            exchange_timeout,
            stats: PoolStats::default(),
        }
    }

    /// Resolve a query through the pool.
    ///
    /// Waits on the rate limiter, then tries up to three times: a transport
    /// failure discards the connection and retries immediately, an
    /// exhausted pool retries after a fixed pause. An upstream non-success
    /// response code is an error but does not cost the connection.
    ///
    /// # Errors
    ///
    /// Returns the last `DnsError` after all attempts fail.
    pub async fn resolve(&self, query: &Message) -> Result<Message, DnsError> {
        self.limiter.until_ready().await;

        let mut last_err = DnsError::PoolExhausted {
            max: self.max_conns,
        };

        for attempt in 1..=EXCHANGE_ATTEMPTS {
            let Some(mut conn) = self.acquire().await else {
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(
                    attempt,
                    max = self.max_conns,
                    "Remote query pool exhausted"
                );
                last_err = DnsError::PoolExhausted {
                    max: self.max_conns,
                };
                tokio::time::sleep(EXHAUSTED_RETRY_DELAY).await;
                continue;
            };

            match self.exchange(&mut conn, query).await {
                Ok(response) => {
                    let rcode = response.response_code();
                    self.release(conn);
                    if rcode == ResponseCode::NoError {
                        return Ok(response);
                    }
                    return Err(DnsError::UpstreamRcode {
                        server: self.server,
                        rcode: rcode.to_string(),
                    });
                }
                Err(e) => {
                    self.discard(conn);
                    debug!(attempt, error = %e, "Remote DNS exchange failed");
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    /// Take a free connection or dial a new one within the bound.
    ///
    /// Dialing happens outside the pool lock; the slot is reserved first
    /// and given back if the dial fails.
    async fn acquire(&self) -> Option<TcpStream> {
        {
            let mut state = self.state.lock();
            if let Some(conn) = state.free.pop() {
                self.stats.reused.fetch_add(1, Ordering::Relaxed);
                return Some(conn);
            }
            if state.live >= self.max_conns {
                return None;
            }
            state.live += 1;
        }

        match timeout(self.exchange_timeout, TcpStream::connect(self.server)).await {
            Ok(Ok(conn)) => {
                self.stats.dialed.fetch_add(1, Ordering::Relaxed);
                debug!(server = %self.server, "Dialed remote resolver");
                Some(conn)
            }
            Ok(Err(e)) => {
                self.state.lock().live -= 1;
                warn!(server = %self.server, error = %e, "Failed to dial remote resolver");
                None
            }
            Err(_) => {
                self.state.lock().live -= 1;
                warn!(server = %self.server, "Dial to remote resolver timed out");
                None
            }
        }
    }

    fn release(&self, conn: TcpStream) {
        self.state.lock().free.push(conn);
    }

    fn discard(&self, conn: TcpStream) {
        drop(conn);
        self.state.lock().live -= 1;
        self.stats.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// One DNS-over-TCP exchange: 2-byte big-endian length framing both ways
    async fn exchange(&self, conn: &mut TcpStream, query: &Message) -> Result<Message, DnsError> {
        let query_bytes = query
            .to_vec()
            .map_err(|e| DnsError::Encode(e.to_string()))?;

        let mut send_buf = Vec::with_capacity(2 + query_bytes.len());
        send_buf.extend_from_slice(&(query_bytes.len() as u16).to_be_bytes());
        send_buf.extend_from_slice(&query_bytes);

        timeout(self.exchange_timeout, conn.write_all(&send_buf))
            .await
            .map_err(|_| DnsError::exchange(self.server, "write timeout"))?
            .map_err(|e| DnsError::exchange(self.server, format!("write: {e}")))?;

        let mut len_buf = [0u8; 2];
        timeout(self.exchange_timeout, conn.read_exact(&mut len_buf))
            .await
            .map_err(|_| DnsError::exchange(self.server, "read timeout"))?
            .map_err(|e| DnsError::exchange(self.server, format!("read length: {e}")))?;

        let response_len = u16::from_be_bytes(len_buf) as usize;
        if response_len == 0 || response_len > MAX_TCP_MESSAGE_SIZE {
            return Err(DnsError::exchange(
                self.server,
                format!("bad response length {response_len}"),
            ));
        }

        let mut response_buf = vec![0u8; response_len];
        timeout(self.exchange_timeout, conn.read_exact(&mut response_buf))
            .await
            .map_err(|_| DnsError::exchange(self.server, "read timeout"))?
            .map_err(|e| DnsError::exchange(self.server, format!("read body: {e}")))?;

        let response = Message::from_vec(&response_buf)
            .map_err(|e| DnsError::Decode(e.to_string()))?;

        if response.id() != query.id() {
            return Err(DnsError::exchange(self.server, "response ID mismatch"));
        }

        Ok(response)
    }

    /// Number of free plus checked-out connections
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.state.lock().live
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            dialed: self.stats.dialed.load(Ordering::Relaxed),
            reused: self.stats.reused.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
            exhausted: self.stats.exhausted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;
    use tokio::net::TcpListener;

    fn test_query(id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(
                Name::from_str("example.com.").unwrap(),
                RecordType::A,
            ));
        msg
    }

    /// One-shot DNS-over-TCP responder that echoes an empty NOERROR answer
    async fn serve_responses(listener: TcpListener, conns: usize) {
        for _ in 0..conns {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                loop {
                    let mut len_buf = [0u8; 2];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                    stream.read_exact(&mut buf).await.unwrap();
                    let query = Message::from_vec(&buf).unwrap();

                    let mut response = Message::new();
                    response
                        .set_id(query.id())
                        .set_message_type(MessageType::Response)
                        .set_response_code(ResponseCode::NoError);
                    let bytes = response.to_vec().unwrap();
                    let mut out = (bytes.len() as u16).to_be_bytes().to_vec();
                    out.extend_from_slice(&bytes);
                    stream.write_all(&out).await.unwrap();
                }
            });
        }
    }

    #[tokio::test]
    async fn test_exchange_and_reuse() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_responses(listener, 1));

        let pool = RemoteResolver::new(addr, 2, 100, 10, Duration::from_secs(2));

        let first = pool.resolve(&test_query(1)).await.unwrap();
        assert_eq!(first.id(), 1);
        let second = pool.resolve(&test_query(2)).await.unwrap();
        assert_eq!(second.id(), 2);

        // Both exchanges rode the same connection.
        let stats = pool.stats();
        assert_eq!(stats.dialed, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(pool.live_connections(), 1);
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_bound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_responses(listener, 2));

        let pool = std::sync::Arc::new(RemoteResolver::new(
            addr,
            2,
            100,
            100,
            Duration::from_secs(2),
        ));

        let mut tasks = Vec::new();
        for id in 0..8u16 {
            let pool = std::sync::Arc::clone(&pool);
            tasks.push(tokio::spawn(
                async move { pool.resolve(&test_query(id)).await },
            ));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(pool.live_connections() <= 2);
        assert!(pool.stats().dialed <= 2);
    }

    #[tokio::test]
    async fn test_unreachable_server_errors_out() {
        // Reserved TEST-NET-1 address, nothing listens there.
        let pool = RemoteResolver::new(
            "192.0.2.1:53".parse().unwrap(),
            1,
            100,
            10,
            Duration::from_millis(50),
        );
        let err = pool.resolve(&test_query(1)).await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(pool.live_connections(), 0);
    }
}
