//! Split-horizon DNS server
//!
//! Listens on UDP and TCP and answers every query with a plain NOERROR
//! response, resolving through one of two paths:
//!
//! - names on the tunnel list go to the tunneled resolver through the
//!   remote query pool, and their IPv4 answers are written into the
//!   firewall's redirect set before the response leaves;
//! - everything else goes straight to the forward resolver.
//!
//! The user's own block list short-circuits both paths: matching names get
//! an empty answer and are never resolved. Resolution failures are also
//! answered empty rather than with an error code, so stub resolvers fail
//! fast instead of retrying against us.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::{AnswerCache, CacheKey, RefreshTicket};
use super::forward::{DirectResolver, MAX_UDP_PAYLOAD};
use super::upstream::RemoteResolver;
use crate::error::DnsError;
use crate::firewall::Firewall;
use crate::rules::Classifier;

/// Idle timeout for an accepted DNS-over-TCP connection
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How often moka's pending maintenance is flushed
const CACHE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Query types the split-horizon path resolves and caches itself; anything
/// else is passed through to the forward resolver uncached.
const fn is_inspected_type(rtype: RecordType) -> bool {
    matches!(
        rtype,
        RecordType::A | RecordType::AAAA | RecordType::MX | RecordType::TXT
    )
}

/// Build the upstream query for one question
fn build_upstream_query(name: Name, rtype: RecordType) -> Message {
    let mut edns = Edns::new();
    edns.set_max_payload(MAX_UDP_PAYLOAD);

    let mut query = Message::new();
    query
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, rtype));
    query.set_edns(edns);
    query
}

/// Per-query classification and resolution
pub struct SplitResolver {
    classifier: Arc<Classifier>,
    cache: AnswerCache,
    forward: DirectResolver,
    remote: Arc<RemoteResolver>,
    firewall: Option<Arc<Firewall>>,
    /// When set, nothing classifies for the tunnel: the server is a plain
    /// caching forwarder
    listener_only: bool,
}

impl SplitResolver {
    /// Wire up a resolver
    #[must_use]
    pub fn new(
        classifier: Arc<Classifier>,
        cache: AnswerCache,
        forward: DirectResolver,
        remote: Arc<RemoteResolver>,
        firewall: Option<Arc<Firewall>>,
        listener_only: bool,
    ) -> Self {
        Self {
            classifier,
            cache,
            forward,
            remote,
            firewall,
            listener_only,
        }
    }

    /// Answer one request message.
    ///
    /// The response echoes the request ID, is marked authoritative with
    /// recursion available, and always carries NOERROR; failures surface
    /// as an empty answer section.
    pub async fn handle_query(&self, request: &Message) -> Message {
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_authoritative(true)
            .set_recursion_desired(request.recursion_desired())
            .set_recursion_available(true)
            .set_response_code(ResponseCode::NoError);

        for question in request.queries() {
            response.add_query(question.clone());
            for answer in self.resolve_question(question).await {
                response.add_answer(answer);
            }
        }

        response
    }

    /// Resolve one question to its answer records
    async fn resolve_question(&self, question: &Query) -> Vec<Record> {
        let name = question.name().to_utf8();
        let rtype = question.query_type();
        let key = CacheKey::new(&name, rtype);

        if let Some(entry) = self.cache.get(&key) {
            return entry.records.clone();
        }

        info!(name = %name, rtype = %rtype, "DNS query");

        if self.classifier.is_user_blocked(&name) {
            debug!(name = %name, "Refused by user block list");
            return Vec::new();
        }

        if !is_inspected_type(rtype) {
            // Uncommon type: hand it to the forward resolver untouched.
            let query = build_upstream_query(question.name().clone(), rtype);
            return match self.forward.resolve(&query).await {
                Ok(response) => response.answers().to_vec(),
                Err(e) => {
                    warn!(name = %name, error = %e, "Passthrough resolution failed");
                    Vec::new()
                }
            };
        }

        let tunneled = !self.listener_only && self.classifier.is_tunneled(&name);
        let query = build_upstream_query(question.name().clone(), rtype);

        let result = if tunneled {
            debug!(name = %name, "Resolving via tunnel");
            self.remote.resolve(&query).await
        } else {
            self.forward.resolve(&query).await
        };

        match result {
            Ok(response) => {
                let records = response.answers().to_vec();
                self.cache.insert(key, records.clone());
                if tunneled {
                    self.provision_firewall(&records).await;
                }
                records
            }
            Err(e) => {
                warn!(name = %name, tunneled, error = %e, "Resolution failed");
                Vec::new()
            }
        }
    }

    /// Re-resolve an expired cache entry through the path its *current*
    /// classification dictates, keeping the old demand timestamp.
    pub async fn refresh(&self, ticket: RefreshTicket) {
        let Ok(name) = Name::from_utf8(&ticket.key.name) else {
            return;
        };

        let tunneled = !self.listener_only && self.classifier.is_tunneled(&ticket.key.name);
        let query = build_upstream_query(name, ticket.key.rtype);

        let result = if tunneled {
            self.remote.resolve(&query).await
        } else {
            self.forward.resolve(&query).await
        };

        match result {
            Ok(response) => {
                let records = response.answers().to_vec();
                debug!(name = %ticket.key.name, tunneled, "Cache entry refreshed");
                if tunneled {
                    self.provision_firewall(&records).await;
                }
                self.cache
                    .reinsert(ticket.key, records, ticket.last_served);
            }
            Err(e) => {
                debug!(name = %ticket.key.name, error = %e, "Cache refresh failed");
            }
        }
    }

    /// Write the IPv4 answers of a tunneled name into the redirect set
    async fn provision_firewall(&self, records: &[Record]) {
        let Some(firewall) = &self.firewall else {
            return;
        };
        for record in records {
            if let Some(RData::A(a)) = record.data() {
                firewall.add_blocked_ipv4(a.0).await;
            }
        }
    }

    /// Access the answer cache (stats, maintenance)
    #[must_use]
    pub fn cache(&self) -> &AnswerCache {
        &self.cache
    }
}

/// UDP + TCP DNS listeners over one resolver
pub struct DnsServer {
    resolver: Arc<SplitResolver>,
    udp: Arc<UdpSocket>,
    tcp: TcpListener,
}

impl DnsServer {
    /// Bind both listeners on `addr`
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Bind` when either socket cannot be bound.
    pub async fn bind(addr: SocketAddr, resolver: Arc<SplitResolver>) -> Result<Self, DnsError> {
        let udp = UdpSocket::bind(addr).await.map_err(|e| DnsError::Bind {
            addr,
            reason: e.to_string(),
        })?;
        let tcp = TcpListener::bind(addr).await.map_err(|e| DnsError::Bind {
            addr,
            reason: e.to_string(),
        })?;

        info!(%addr, "DNS server listening (udp+tcp)");

        Ok(Self {
            resolver,
            udp: Arc::new(udp),
            tcp,
        })
    }

    /// Serve until cancelled (run inside a task and abort on shutdown)
    pub async fn run(self) {
        let udp_task = Self::run_udp(Arc::clone(&self.resolver), Arc::clone(&self.udp));
        let tcp_task = Self::run_tcp(Arc::clone(&self.resolver), self.tcp);
        let maintenance = Self::run_maintenance(Arc::clone(&self.resolver));

        tokio::select! {
            () = udp_task => {}
            () = tcp_task => {}
            () = maintenance => {}
        }
    }

    async fn run_udp(resolver: Arc<SplitResolver>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; usize::from(MAX_UDP_PAYLOAD)];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "UDP receive failed");
                    continue;
                }
            };

            let request = match Message::from_vec(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(%peer, error = %e, "Undecodable UDP query dropped");
                    continue;
                }
            };

            let resolver = Arc::clone(&resolver);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                let response = resolver.handle_query(&request).await;
                match response.to_vec() {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, peer).await {
                            debug!(%peer, error = %e, "Failed to send UDP response");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode DNS response"),
                }
            });
        }
    }

    async fn run_tcp(resolver: Arc<SplitResolver>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "TCP accept failed");
                    continue;
                }
            };

            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move {
                if let Err(e) = Self::serve_tcp_conn(&resolver, stream).await {
                    debug!(%peer, error = %e, "TCP DNS connection ended");
                }
            });
        }
    }

    /// Serve length-prefixed queries on one connection until EOF or idle
    async fn serve_tcp_conn(
        resolver: &SplitResolver,
        mut stream: TcpStream,
    ) -> Result<(), DnsError> {
        loop {
            let mut len_buf = [0u8; 2];
            match tokio::time::timeout(TCP_IDLE_TIMEOUT, stream.read_exact(&mut len_buf)).await {
                Ok(Ok(_)) => {}
                // EOF and idle both just end the connection.
                Ok(Err(_)) | Err(_) => return Ok(()),
            }

            let len = usize::from(u16::from_be_bytes(len_buf));
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;

            let request =
                Message::from_vec(&buf).map_err(|e| DnsError::Decode(e.to_string()))?;
            let response = resolver.handle_query(&request).await;
            let bytes = response
                .to_vec()
                .map_err(|e| DnsError::Encode(e.to_string()))?;

            let mut out = Vec::with_capacity(2 + bytes.len());
            out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            out.extend_from_slice(&bytes);
            stream.write_all(&out).await?;
        }
    }

    async fn run_maintenance(resolver: Arc<SplitResolver>) {
        let mut ticker = tokio::time::interval(CACHE_MAINTENANCE_INTERVAL);
        loop {
            ticker.tick().await;
            resolver.cache().run_pending_tasks();
        }
    }
}

/// Drain refresh tickets produced by cache expiry
pub fn spawn_refresh_worker(
    resolver: Arc<SplitResolver>,
    mut rx: mpsc::UnboundedReceiver<RefreshTicket>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(ticket) = rx.recv().await {
            resolver.refresh(ticket).await;
        }
    })
}
