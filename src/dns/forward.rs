//! Direct-path resolver client
//!
//! Plain UDP exchange with the configured forward resolver, used for names
//! that do not classify for the tunnel and as the passthrough for query
//! types the split-horizon logic does not inspect.

use std::net::SocketAddr;
use std::time::Duration;

use hickory_proto::op::{Message, ResponseCode};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::DnsError;

/// Largest UDP response we accept (EDNS0 advertises this)
pub const MAX_UDP_PAYLOAD: u16 = 4096;

/// UDP client for one upstream resolver
#[derive(Debug, Clone)]
pub struct DirectResolver {
    server: SocketAddr,
    exchange_timeout: Duration,
}

impl DirectResolver {
    /// Create a client for `server`
    #[must_use]
    pub const fn new(server: SocketAddr, exchange_timeout: Duration) -> Self {
        Self {
            server,
            exchange_timeout,
        }
    }

    /// The upstream this client talks to
    #[must_use]
    pub const fn server(&self) -> SocketAddr {
        self.server
    }

    /// One UDP exchange.
    ///
    /// # Errors
    ///
    /// Returns `DnsError` on transport failure, timeout, a garbled or
    /// mismatched response, or a non-success response code.
    pub async fn resolve(&self, query: &Message) -> Result<Message, DnsError> {
        let bind_addr: SocketAddr = if self.server.is_ipv4() {
            "0.0.0.0:0".parse().map_err(|_| DnsError::Decode("bind addr".into()))?
        } else {
            "[::]:0".parse().map_err(|_| DnsError::Decode("bind addr".into()))?
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.server).await?;

        let query_bytes = query
            .to_vec()
            .map_err(|e| DnsError::Encode(e.to_string()))?;
        socket.send(&query_bytes).await?;

        let mut buf = vec![0u8; usize::from(MAX_UDP_PAYLOAD)];
        let len = timeout(self.exchange_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| DnsError::exchange(self.server, "response timeout"))??;

        let response =
            Message::from_vec(&buf[..len]).map_err(|e| DnsError::Decode(e.to_string()))?;

        if response.id() != query.id() {
            return Err(DnsError::exchange(self.server, "response ID mismatch"));
        }

        let rcode = response.response_code();
        if rcode != ResponseCode::NoError {
            return Err(DnsError::UpstreamRcode {
                server: self.server,
                rcode: rcode.to_string(),
            });
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;

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

    async fn one_shot_server(rcode: ResponseCode, answer: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..len]).unwrap();

            let mut response = Message::new();
            response
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_response_code(rcode);
            if answer {
                response.add_answer(Record::from_rdata(
                    Name::from_str("example.com.").unwrap(),
                    60,
                    RData::A(A::new(93, 184, 216, 34)),
                ));
            }
            socket
                .send_to(&response.to_vec().unwrap(), peer)
                .await
                .unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_successful_exchange() {
        let server = one_shot_server(ResponseCode::NoError, true).await;
        let resolver = DirectResolver::new(server, Duration::from_secs(2));
        let response = resolver.resolve(&test_query(7)).await.unwrap();
        assert_eq!(response.id(), 7);
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_rcode_is_error() {
        let server = one_shot_server(ResponseCode::ServFail, false).await;
        let resolver = DirectResolver::new(server, Duration::from_secs(2));
        let err = resolver.resolve(&test_query(7)).await.unwrap_err();
        assert!(matches!(err, DnsError::UpstreamRcode { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_timeout() {
        // Bind a socket that never answers.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = socket.local_addr().unwrap();
        let resolver = DirectResolver::new(server, Duration::from_millis(50));
        let err = resolver.resolve(&test_query(7)).await.unwrap_err();
        assert!(matches!(err, DnsError::Exchange { .. }));
    }
}
