//! Network interface discovery
//!
//! Resolves the configured egress interface to its IPv4 address and its
//! directly-connected subnet. The subnet feeds the flow tracker's filter
//! chain (only connections from the local subnet are tracked); the address
//! is reported in logs and used for sanity checks at startup.
//!
//! The subnet comes from `/proc/net/route`: entries for the interface with a
//! zero gateway describe directly-connected networks. Destination and mask
//! are hex-encoded little-endian u32 values.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::ConfigError;

/// Find the directly-connected IPv4 subnet of an interface
///
/// # Errors
///
/// Returns `ConfigError::Interface` if the route table cannot be read or
/// contains no connected route for the interface.
pub fn interface_subnet(ifname: &str) -> Result<Ipv4Net, ConfigError> {
    let contents = std::fs::read_to_string("/proc/net/route")
        .map_err(|e| ConfigError::interface(ifname, format!("cannot read route table: {e}")))?;

    parse_route_table(&contents, ifname)
        .ok_or_else(|| ConfigError::interface(ifname, "no connected route found"))
}

/// Parse a `/proc/net/route` document and return the first connected
/// (zero-gateway, non-default) route for `ifname`.
fn parse_route_table(contents: &str, ifname: &str) -> Option<Ipv4Net> {
    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 || fields[0] != ifname {
            continue;
        }

        let dest = u32::from_str_radix(fields[1], 16).ok()?;
        let gateway = u32::from_str_radix(fields[2], 16).ok()?;
        let mask = u32::from_str_radix(fields[7], 16).ok()?;

        // Connected routes have no gateway; the default route has no mask.
        if gateway != 0 || mask == 0 {
            continue;
        }

        let addr = Ipv4Addr::from(dest.to_le_bytes());
        let mask = Ipv4Addr::from(mask.to_le_bytes());
        let prefix = u8::try_from(u32::from(mask).count_ones()).ok()?;

        if let Ok(net) = Ipv4Net::new(addr, prefix) {
            return Some(net);
        }
    }
    None
}

/// Find the IPv4 address assigned to an interface
///
/// # Errors
///
/// Returns `ConfigError::Interface` if the interface has no IPv4 address.
#[cfg(target_os = "linux")]
pub fn interface_addr(ifname: &str) -> Result<Ipv4Addr, ConfigError> {
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY: getifaddrs fills ifap with a heap-allocated list that we walk
    // read-only and release with freeifaddrs before returning.
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(ConfigError::interface(
            ifname,
            format!("getifaddrs failed: {}", std::io::Error::last_os_error()),
        ));
    }

    let mut found = None;
    let mut cursor = ifap;
    while !cursor.is_null() {
        // SAFETY: cursor is a valid node of the list returned by getifaddrs.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_addr.is_null() {
            continue;
        }
        // SAFETY: ifa_addr is non-null and points at a sockaddr.
        let family = i32::from(unsafe { (*entry.ifa_addr).sa_family });
        if family != libc::AF_INET {
            continue;
        }
        // SAFETY: ifa_name is a NUL-terminated string owned by the list.
        let name = unsafe { std::ffi::CStr::from_ptr(entry.ifa_name) };
        if name.to_string_lossy() != ifname {
            continue;
        }
        // SAFETY: AF_INET entries carry a sockaddr_in.
        let sin = unsafe { &*entry.ifa_addr.cast::<libc::sockaddr_in>() };
        found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
        break;
    }

    // SAFETY: ifap was produced by getifaddrs above.
    unsafe { libc::freeifaddrs(ifap) };

    found.ok_or_else(|| ConfigError::interface(ifname, "no IPv4 address assigned"))
}

/// Non-Linux stub; interface discovery only matters where the firewall runs.
#[cfg(not(target_os = "linux"))]
pub fn interface_addr(ifname: &str) -> Result<Ipv4Addr, ConfigError> {
    Err(ConfigError::interface(
        ifname,
        "interface discovery is only supported on Linux",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTE_TABLE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0100A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0000A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
wlan0\t0000FEA9\t00000000\t0001\t0\t0\t600\t0000FFFF\t0\t0\t0
";

    #[test]
    fn test_parse_connected_route() {
        let net = parse_route_table(ROUTE_TABLE, "eth0").unwrap();
        assert_eq!(net, "192.168.0.0/24".parse().unwrap());
    }

    #[test]
    fn test_default_route_skipped() {
        // The eth0 default route (mask 0) must not be selected even though
        // it appears first.
        let net = parse_route_table(ROUTE_TABLE, "eth0").unwrap();
        assert_ne!(net.prefix_len(), 0);
    }

    #[test]
    fn test_unknown_interface() {
        assert!(parse_route_table(ROUTE_TABLE, "eth1").is_none());
    }

    #[test]
    fn test_sixteen_bit_mask() {
        let net = parse_route_table(ROUTE_TABLE, "wlan0").unwrap();
        assert_eq!(net, "169.254.0.0/16".parse().unwrap());
    }
}
