use if_addrs::{get_if_addrs, IfAddr};
use local_ip_address::local_ip;
use log::{debug, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Get the local machine's main IP address, falling back to loopback
pub fn get_local_ip() -> IpAddr {
    match local_ip() {
        Ok(ip) => ip,
        Err(err) => {
            warn!("Failed to determine local IP, using loopback: {}", err);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Directed broadcast addresses of every non-loopback IPv4 interface
pub fn interface_broadcast_addresses() -> Vec<Ipv4Addr> {
    let interfaces = match get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(err) => {
            warn!("Failed to get network interfaces: {}", err);
            return Vec::new();
        }
    };

    let mut addrs = Vec::new();
    for interface in interfaces {
        if interface.is_loopback() {
            continue;
        }
        if let IfAddr::V4(v4) = &interface.addr {
            if let Some(broadcast) = v4.broadcast {
                debug!("Interface {} broadcasts on {}", interface.name, broadcast);
                if !addrs.contains(&broadcast) {
                    addrs.push(broadcast);
                }
            }
        }
    }
    addrs
}

/// Where discovery announcements go when no explicit targets are configured
pub fn default_broadcast_targets(discovery_port: u16) -> Vec<SocketAddr> {
    let mut targets = vec![SocketAddr::from((Ipv4Addr::BROADCAST, discovery_port))];
    for addr in interface_broadcast_addresses() {
        let target = SocketAddr::from((addr, discovery_port));
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_targets_include_limited_broadcast() {
        let targets = default_broadcast_targets(5001);
        assert_eq!(targets[0], "255.255.255.255:5001".parse::<SocketAddr>().unwrap());
        assert!(targets.iter().all(|t| t.port() == 5001));
    }
}
