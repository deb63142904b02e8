//! Conntrack event source (Linux)
//!
//! Subscribes to the kernel's connection-tracking event groups over a raw
//! `NETLINK_NETFILTER` socket and translates new/update/destroy messages
//! into [`FlowEvent`]s. Only the original-direction tuple and the timeout
//! attribute are decoded; everything else in a message is skipped.
//!
//! The socket is read from a dedicated OS thread: netlink reads are
//! blocking and the decode work is trivial, so tying up a runtime worker
//! for it would be wasteful.
//!
//! Requires `CAP_NET_ADMIN`.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::event::{EventSender, FlowEvent, FlowKey};
use crate::error::FlowError;

const NETLINK_NETFILTER: libc::c_int = 12;

// Conntrack multicast groups
const NF_NETLINK_CONNTRACK_NEW: u32 = 0x1;
const NF_NETLINK_CONNTRACK_UPDATE: u32 = 0x2;
const NF_NETLINK_CONNTRACK_DESTROY: u32 = 0x4;

// nlmsghdr type decomposition
const NFNL_SUBSYS_CTNETLINK: u16 = 1;
const IPCTNL_MSG_CT_NEW: u16 = 0;
const IPCTNL_MSG_CT_DELETE: u16 = 2;

// Conntrack attributes (nested under the message payload)
const CTA_TUPLE_ORIG: u16 = 1;
const CTA_TIMEOUT: u16 = 7;
const CTA_TUPLE_IP: u16 = 1;
const CTA_TUPLE_PROTO: u16 = 2;
const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;
const CTA_IP_V6_SRC: u16 = 3;
const CTA_IP_V6_DST: u16 = 4;
const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;

const NLMSG_HDRLEN: usize = 16;
const NFGENMSG_LEN: usize = 4;
const NLA_HDRLEN: usize = 4;
const NLA_TYPE_MASK: u16 = 0x3fff;

const RECV_BUF_LEN: usize = 64 * 1024;

/// Subscribed conntrack event socket
pub struct ConntrackSource {
    fd: RawFd,
}

impl ConntrackSource {
    /// Open and bind a netlink socket subscribed to the conntrack groups
    ///
    /// # Errors
    ///
    /// Returns `FlowError::EventSource` when the socket cannot be created
    /// or bound (typically missing `CAP_NET_ADMIN`).
    pub fn open() -> Result<Self, FlowError> {
        // SAFETY: plain socket(2) call; the fd is owned by the returned
        // struct and closed on drop.
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_NETFILTER,
            )
        };
        if fd < 0 {
            return Err(FlowError::EventSource(format!(
                "socket: {}",
                io::Error::last_os_error()
            )));
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups =
            NF_NETLINK_CONNTRACK_NEW | NF_NETLINK_CONNTRACK_UPDATE | NF_NETLINK_CONNTRACK_DESTROY;

        // SAFETY: addr is a properly initialized sockaddr_nl and fd is a
        // valid netlink socket.
        let ret = unsafe {
            libc::bind(
                fd,
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used after close.
            unsafe { libc::close(fd) };
            return Err(FlowError::EventSource(format!("bind: {err}")));
        }

        Ok(Self { fd })
    }

    /// Read events on a dedicated thread until the socket errors
    ///
    /// # Errors
    ///
    /// Returns `FlowError::EventSource` if the thread cannot be spawned.
    pub fn spawn(self, sender: EventSender) -> Result<std::thread::JoinHandle<()>, FlowError> {
        std::thread::Builder::new()
            .name("conntrack".into())
            .spawn(move || {
                info!("Conntrack event source started");
                let mut buf = vec![0u8; RECV_BUF_LEN];
                loop {
                    // SAFETY: buf outlives the call and its length is passed.
                    let n = unsafe {
                        libc::recv(
                            self.fd,
                            buf.as_mut_ptr().cast::<libc::c_void>(),
                            buf.len(),
                            0,
                        )
                    };
                    if n < 0 {
                        let err = io::Error::last_os_error();
                        if err.kind() == io::ErrorKind::Interrupted {
                            continue;
                        }
                        warn!("Conntrack recv failed, stopping: {}", err);
                        break;
                    }
                    #[allow(clippy::cast_sign_loss)]
                    for event in parse_datagram(&buf[..n as usize]) {
                        sender.send(event);
                    }
                }
            })
            .map_err(|e| FlowError::EventSource(format!("spawn: {e}")))
    }
}

impl Drop for ConntrackSource {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this struct.
        unsafe { libc::close(self.fd) };
    }
}

/// Decode every conntrack message in one netlink datagram
fn parse_datagram(buf: &[u8]) -> Vec<FlowEvent> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= buf.len() {
        let msg_len = read_u32_ne(&buf[offset..]) as usize;
        if msg_len < NLMSG_HDRLEN || offset + msg_len > buf.len() {
            break;
        }
        let msg_type = read_u16_ne(&buf[offset + 4..]);
        let payload = &buf[offset + NLMSG_HDRLEN..offset + msg_len];

        if let Some(event) = parse_message(msg_type, payload) {
            events.push(event);
        }

        offset += align4(msg_len);
    }

    events
}

/// Decode one conntrack message payload (after the nlmsghdr)
fn parse_message(msg_type: u16, payload: &[u8]) -> Option<FlowEvent> {
    if msg_type >> 8 != NFNL_SUBSYS_CTNETLINK {
        return None;
    }
    let ct_type = msg_type & 0xff;
    if ct_type != IPCTNL_MSG_CT_NEW && ct_type != IPCTNL_MSG_CT_DELETE {
        return None;
    }
    if payload.len() < NFGENMSG_LEN {
        return None;
    }

    let mut src_ip = None;
    let mut dst_ip = None;
    let mut src_port = None;
    let mut dst_port = None;
    let mut proto = None;
    let mut timeout = None;

    for (attr_type, value) in attrs(&payload[NFGENMSG_LEN..]) {
        match attr_type {
            CTA_TUPLE_ORIG => {
                for (tuple_type, tuple_value) in attrs(value) {
                    match tuple_type {
                        CTA_TUPLE_IP => {
                            for (ip_type, ip_value) in attrs(tuple_value) {
                                match (ip_type, ip_value.len()) {
                                    (CTA_IP_V4_SRC, 4) => {
                                        src_ip = Some(IpAddr::V4(Ipv4Addr::from(
                                            read_bytes::<4>(ip_value),
                                        )));
                                    }
                                    (CTA_IP_V4_DST, 4) => {
                                        dst_ip = Some(IpAddr::V4(Ipv4Addr::from(
                                            read_bytes::<4>(ip_value),
                                        )));
                                    }
                                    (CTA_IP_V6_SRC, 16) => {
                                        src_ip = Some(IpAddr::V6(Ipv6Addr::from(
                                            read_bytes::<16>(ip_value),
                                        )));
                                    }
                                    (CTA_IP_V6_DST, 16) => {
                                        dst_ip = Some(IpAddr::V6(Ipv6Addr::from(
                                            read_bytes::<16>(ip_value),
                                        )));
                                    }
                                    _ => {}
                                }
                            }
                        }
                        CTA_TUPLE_PROTO => {
                            for (proto_type, proto_value) in attrs(tuple_value) {
                                match (proto_type, proto_value.len()) {
                                    (CTA_PROTO_NUM, 1) => proto = Some(proto_value[0]),
                                    (CTA_PROTO_SRC_PORT, 2) => {
                                        src_port = Some(u16::from_be_bytes(
                                            read_bytes::<2>(proto_value),
                                        ));
                                    }
                                    (CTA_PROTO_DST_PORT, 2) => {
                                        dst_port = Some(u16::from_be_bytes(
                                            read_bytes::<2>(proto_value),
                                        ));
                                    }
                                    _ => {}
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            CTA_TIMEOUT if value.len() == 4 => {
                timeout = Some(u32::from_be_bytes(read_bytes::<4>(value)));
            }
            _ => {}
        }
    }

    let key = FlowKey {
        addr: src_ip?,
        port: src_port?,
        proto: proto?,
    };

    if ct_type == IPCTNL_MSG_CT_DELETE {
        debug!(src = %key.addr, port = key.port, "conntrack destroy");
        return Some(FlowEvent::Destroyed { key });
    }

    let dest = SocketAddr::new(dst_ip?, dst_port?);
    debug!(src = %key.addr, port = key.port, %dest, ?timeout, "conntrack establish");
    Some(FlowEvent::Established {
        key,
        dest,
        timeout: timeout.map(|secs| Duration::from_secs(u64::from(secs))),
    })
}

/// Iterate netlink attributes in a buffer, yielding `(type, value)` pairs
fn attrs(buf: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    let mut offset = 0;
    std::iter::from_fn(move || {
        while offset + NLA_HDRLEN <= buf.len() {
            let len = read_u16_ne(&buf[offset..]) as usize;
            let attr_type = read_u16_ne(&buf[offset + 2..]) & NLA_TYPE_MASK;
            if len < NLA_HDRLEN || offset + len > buf.len() {
                return None;
            }
            let value = &buf[offset + NLA_HDRLEN..offset + len];
            offset += align4(len);
            return Some((attr_type, value));
        }
        None
    })
}

const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn read_u16_ne(buf: &[u8]) -> u16 {
    u16::from_ne_bytes([buf[0], buf[1]])
}

fn read_u32_ne(buf: &[u8]) -> u32 {
    u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn read_bytes<const N: usize>(buf: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[..N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_attr(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
        let len = (NLA_HDRLEN + value.len()) as u16;
        buf.extend_from_slice(&len.to_ne_bytes());
        buf.extend_from_slice(&attr_type.to_ne_bytes());
        buf.extend_from_slice(value);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }

    fn push_nested(buf: &mut Vec<u8>, attr_type: u16, inner: &[u8]) {
        // NLA_F_NESTED set, as the kernel does
        push_attr(buf, attr_type | 0x8000, inner);
    }

    fn tuple_orig(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        let mut ip = Vec::new();
        push_attr(&mut ip, CTA_IP_V4_SRC, &src);
        push_attr(&mut ip, CTA_IP_V4_DST, &dst);

        let mut proto = Vec::new();
        push_attr(&mut proto, CTA_PROTO_NUM, &[6]);
        push_attr(&mut proto, CTA_PROTO_SRC_PORT, &sport.to_be_bytes());
        push_attr(&mut proto, CTA_PROTO_DST_PORT, &dport.to_be_bytes());

        let mut tuple = Vec::new();
        push_nested(&mut tuple, CTA_TUPLE_IP, &ip);
        push_nested(&mut tuple, CTA_TUPLE_PROTO, &proto);
        tuple
    }

    fn datagram(ct_type: u16, attrs_buf: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        let msg_len = (NLMSG_HDRLEN + NFGENMSG_LEN + attrs_buf.len()) as u32;
        msg.extend_from_slice(&msg_len.to_ne_bytes());
        msg.extend_from_slice(&((NFNL_SUBSYS_CTNETLINK << 8) | ct_type).to_ne_bytes());
        msg.extend_from_slice(&0u16.to_ne_bytes()); // flags
        msg.extend_from_slice(&0u32.to_ne_bytes()); // seq
        msg.extend_from_slice(&0u32.to_ne_bytes()); // pid
        msg.extend_from_slice(&[libc::AF_INET as u8, 0, 0, 0]); // nfgenmsg
        msg.extend_from_slice(attrs_buf);
        msg
    }

    #[test]
    fn test_parse_establish_event() {
        let mut attrs_buf = tuple_orig([192, 168, 1, 10], [93, 184, 216, 34], 40000, 443);
        let mut wrapped = Vec::new();
        push_nested(&mut wrapped, CTA_TUPLE_ORIG, &attrs_buf);
        push_attr(&mut wrapped, CTA_TIMEOUT, &120u32.to_be_bytes());
        attrs_buf = wrapped;

        let events = parse_datagram(&datagram(IPCTNL_MSG_CT_NEW, &attrs_buf));
        assert_eq!(events.len(), 1);
        match events[0] {
            FlowEvent::Established { key, dest, timeout } => {
                assert_eq!(key.addr, "192.168.1.10".parse::<IpAddr>().unwrap());
                assert_eq!(key.port, 40000);
                assert_eq!(key.proto, 6);
                assert_eq!(dest, "93.184.216.34:443".parse().unwrap());
                assert_eq!(timeout, Some(Duration::from_secs(120)));
            }
            FlowEvent::Destroyed { .. } => panic!("expected establish"),
        }
    }

    #[test]
    fn test_parse_destroy_event() {
        let tuple = tuple_orig([192, 168, 1, 10], [93, 184, 216, 34], 40000, 443);
        let mut attrs_buf = Vec::new();
        push_nested(&mut attrs_buf, CTA_TUPLE_ORIG, &tuple);

        let events = parse_datagram(&datagram(IPCTNL_MSG_CT_DELETE, &attrs_buf));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], FlowEvent::Destroyed { key } if key.port == 40000));
    }

    #[test]
    fn test_multiple_messages_per_datagram() {
        let tuple = tuple_orig([192, 168, 1, 10], [93, 184, 216, 34], 40000, 443);
        let mut attrs_buf = Vec::new();
        push_nested(&mut attrs_buf, CTA_TUPLE_ORIG, &tuple);

        let mut buf = datagram(IPCTNL_MSG_CT_NEW, &attrs_buf);
        buf.extend_from_slice(&datagram(IPCTNL_MSG_CT_DELETE, &attrs_buf));

        let events = parse_datagram(&buf);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_foreign_subsystem_ignored() {
        let tuple = tuple_orig([192, 168, 1, 10], [93, 184, 216, 34], 40000, 443);
        let mut attrs_buf = Vec::new();
        push_nested(&mut attrs_buf, CTA_TUPLE_ORIG, &tuple);

        let mut buf = datagram(IPCTNL_MSG_CT_NEW, &attrs_buf);
        // Rewrite the type to a non-conntrack subsystem.
        buf[4..6].copy_from_slice(&((5u16 << 8) | IPCTNL_MSG_CT_NEW).to_ne_bytes());
        assert!(parse_datagram(&buf).is_empty());
    }

    #[test]
    fn test_truncated_datagram() {
        let tuple = tuple_orig([192, 168, 1, 10], [93, 184, 216, 34], 40000, 443);
        let mut attrs_buf = Vec::new();
        push_nested(&mut attrs_buf, CTA_TUPLE_ORIG, &tuple);

        let buf = datagram(IPCTNL_MSG_CT_NEW, &attrs_buf);
        assert!(parse_datagram(&buf[..buf.len() - 8]).is_empty());
    }

    #[test]
    fn test_incomplete_tuple_dropped() {
        // Timeout but no tuple: not decodable into an event.
        let mut attrs_buf = Vec::new();
        push_attr(&mut attrs_buf, CTA_TIMEOUT, &120u32.to_be_bytes());
        assert!(parse_datagram(&datagram(IPCTNL_MSG_CT_NEW, &attrs_buf)).is_empty());
    }
}
