use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Creates a non-blocking UDP socket bound to `bind_addr`, optionally pinned
/// to a network interface.
pub fn new_udp_socket(
    bind_addr: SocketAddr,
    bind_interface: Option<&str>,
) -> std::io::Result<tokio::net::UdpSocket> {
    let std_socket = std::net::UdpSocket::bind(bind_addr)?;
    std_socket.set_nonblocking(true)?;

    // tokio's UdpSocket has bind_device, so construct that instead of having to
    // handle SO_BINDTODEVICE ourselves.
    let tokio_socket = tokio::net::UdpSocket::from_std(std_socket)?;
    if let Some(_b) = bind_interface {
        #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
        tokio_socket.bind_device(Some(_b.as_bytes()))?;

        // This should be handled during config validation.
        #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
        return Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "bind_interface is not supported on this platform",
        ));
    }

    Ok(tokio_socket)
}

/// Picks an ephemeral bind address for a socket that will talk to `peer`.
///
/// Keeps the IP of `preferred` when it is a concrete address of the same
/// family, so auxiliary sockets leave through the same interface as the
/// primary one.
pub fn ephemeral_bind_addr(peer: &SocketAddr, preferred: Option<&SocketAddr>) -> SocketAddr {
    if let Some(preferred) = preferred
        && !preferred.ip().is_unspecified()
        && preferred.is_ipv6() == peer.is_ipv6()
    {
        return SocketAddr::new(preferred.ip(), 0);
    }
    let ip = if peer.is_ipv6() {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    SocketAddr::new(ip, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_bind_addr_follows_family() {
        let v4: SocketAddr = "1.1.1.1:53".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        assert_eq!(ephemeral_bind_addr(&v4, None), "0.0.0.0:0".parse().unwrap());
        assert_eq!(ephemeral_bind_addr(&v6, None), "[::]:0".parse().unwrap());
    }

    #[test]
    fn test_ephemeral_bind_addr_keeps_concrete_ip() {
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let primary: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(
            ephemeral_bind_addr(&peer, Some(&primary)),
            "127.0.0.1:0".parse().unwrap()
        );

        let wildcard: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        assert_eq!(
            ephemeral_bind_addr(&peer, Some(&wildcard)),
            "0.0.0.0:0".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn test_new_udp_socket_binds_loopback() {
        let socket = new_udp_socket("127.0.0.1:0".parse().unwrap(), None).unwrap();
        let local = socket.local_addr().unwrap();
        assert!(local.ip().is_loopback());
        assert_ne!(local.port(), 0);
    }
}
