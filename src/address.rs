use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub const UNSPECIFIED: Self = Address::Ipv4(Ipv4Addr::UNSPECIFIED);

    pub fn from(s: &str) -> std::io::Result<Self> {
        let mut dots = 0;
        let mut possible_ipv4 = true;
        let mut possible_ipv6 = true;
        let mut possible_hostname = true;
        for b in s.as_bytes().iter() {
            let c = *b;
            if c == b':' {
                possible_ipv4 = false;
                possible_hostname = false;
                break;
            } else if c == b'.' {
                possible_ipv6 = false;
                dots += 1;
                if dots > 3 {
                    // can only be a hostname.
                    break;
                }
            } else if (b'A'..=b'F').contains(&c) || (b'a'..=b'f').contains(&c) {
                possible_ipv4 = false;
            } else if !c.is_ascii_digit() {
                possible_ipv4 = false;
                possible_ipv6 = false;
                break;
            }
        }

        if possible_ipv4
            && dots == 3
            && let Ok(addr) = s.parse::<Ipv4Addr>()
        {
            return Ok(Address::Ipv4(addr));
        }

        if possible_ipv6 && let Ok(addr) = s.parse::<Ipv6Addr>() {
            return Ok(Address::Ipv6(addr));
        }

        if possible_hostname && !s.is_empty() {
            return Ok(Address::Hostname(s.to_string()));
        }

        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to parse address: {s}"),
        ))
    }

    /// Builds an address from an IP, unwrapping IPv4-mapped IPv6 addresses so
    /// that dual-stack sockets report IPv4 peers the same way IPv4 sockets do.
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Address::Ipv4(v4),
                None => Address::Ipv6(v6),
            },
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Address::Ipv6(_))
    }

    pub fn is_hostname(&self) -> bool {
        matches!(self, Address::Hostname(_))
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Hostname(hostname) => Some(hostname),
            _ => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(addr) => Some(IpAddr::V4(*addr)),
            Address::Ipv6(addr) => Some(IpAddr::V6(*addr)),
            Address::Hostname(_) => None,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Address::Ipv4(i) => write!(f, "{i}"),
            Address::Ipv6(i) => write!(f, "{i}"),
            Address::Hostname(h) => write!(f, "{h}"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NetLocation {
    address: Address,
    port: u16,
}

impl NetLocation {
    pub const UNSPECIFIED: Self = NetLocation::new(Address::UNSPECIFIED, 0);

    pub const fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn is_unspecified(&self) -> bool {
        self == &Self::UNSPECIFIED
    }

    pub fn from_str(s: &str, default_port: Option<u16>) -> std::io::Result<Self> {
        // Bracketed IPv6: [::1]:53
        if let Some(rest) = s.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| std::io::Error::other("Invalid location"))?;
            let address = Address::from(&rest[..end])?;
            if !address.is_ipv6() {
                return Err(std::io::Error::other("Invalid location"));
            }
            let port = match rest[end + 1..].strip_prefix(':') {
                Some(port_str) => Some(
                    port_str
                        .parse::<u16>()
                        .map_err(|e| std::io::Error::other(format!("Invalid port: {e}")))?,
                ),
                None => default_port,
            };
            let port = port.ok_or_else(|| std::io::Error::other("No port"))?;
            return Ok(Self { address, port });
        }

        let (address_str, port, expect_ipv6) = match s.rfind(':') {
            Some(i) => {
                // The ':' could be from an ipv6 address.
                match s[i + 1..].parse::<u16>() {
                    Ok(port) if !s[..i].contains(':') => (&s[0..i], Some(port), false),
                    _ => (s, default_port, true),
                }
            }
            None => (s, default_port, false),
        };

        let address = Address::from(address_str)?;
        if expect_ipv6 && !address.is_ipv6() {
            return Err(std::io::Error::other("Invalid location"));
        }

        let port = port.ok_or_else(|| std::io::Error::other("No port"))?;

        Ok(Self { address, port })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(Address::from_ip(addr.ip()), addr.port())
    }

    pub fn components(&self) -> (&Address, u16) {
        (&self.address, self.port)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn to_socket_addr_nonblocking(&self) -> Option<SocketAddr> {
        self.address.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl std::fmt::Display for NetLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.address.is_ipv6() {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

impl serde::ser::Serialize for NetLocation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::de::Deserialize<'de> for NetLocation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        NetLocation::from_str(&value, None).map_err(|_| {
            serde::de::Error::invalid_value(
                serde::de::Unexpected::Str(&value),
                &"a location such as 127.0.0.1:53, [::1]:53 or example.com:53",
            )
        })
    }
}

/// Transport network a datagram address belongs to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Udp,
    Tcp,
    Unix,
}

impl Network {
    fn tag(self) -> u8 {
        match self {
            Network::Udp => 0,
            Network::Tcp => 1,
            Network::Unix => 2,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Network::Udp => write!(f, "udp"),
            Network::Tcp => write!(f, "tcp"),
            Network::Unix => write!(f, "unix"),
        }
    }
}

/// A peer address as seen by the relay: a location plus the network it lives on.
///
/// Only the resolved form (see [`Addr::key`]) identifies a NAT peer. Two `Addr`s
/// naming the same host by domain and by IP are different values but may map to
/// the same key once the domain is resolved.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Addr {
    location: NetLocation,
    network: Network,
}

impl Addr {
    pub const fn new(location: NetLocation, network: Network) -> Self {
        Self { location, network }
    }

    pub const fn udp(location: NetLocation) -> Self {
        Self::new(location, Network::Udp)
    }

    pub fn from_socket_addr(addr: SocketAddr, network: Network) -> Self {
        Self::new(NetLocation::from_socket_addr(addr), network)
    }

    pub fn location(&self) -> &NetLocation {
        &self.location
    }

    pub fn address(&self) -> &Address {
        self.location.address()
    }

    pub fn port(&self) -> u16 {
        self.location.port()
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn to_socket_addr_nonblocking(&self) -> Option<SocketAddr> {
        self.location.to_socket_addr_nonblocking()
    }

    /// Canonical fixed-width key used to index peer tables.
    ///
    /// Fails with `InvalidInput` for domain names, which have to be resolved
    /// before they reach a peer table.
    pub fn key(&self) -> std::io::Result<AddrKey> {
        match self.location.address().ip() {
            Some(ip) => Ok(AddrKey::new(ip, self.location.port(), self.network)),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("domain name {self} cannot be used as a peer key"),
            )),
        }
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}://{}", self.network, self.location)
    }
}

/// Hashable peer identity: IPv6 (or IPv4-mapped) address bytes, port and network tag.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct AddrKey {
    ip: [u8; 16],
    port: u16,
    network: u8,
}

impl AddrKey {
    pub fn new(ip: IpAddr, port: u16, network: Network) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            ip,
            port,
            network: network.tag(),
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, network: Network) -> Self {
        Self::new(addr.ip(), addr.port(), network)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        SocketAddr::new(ip, self.port)
    }
}

impl std::fmt::Display for AddrKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}
