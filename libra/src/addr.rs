//! The destination/bound address model shared by SOCKS4 and SOCKS5.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// A SOCKS address: an IPv4 address, an IPv6 address (SOCKS5 only), or a
/// domain name (SOCKS4a / SOCKS5), each carrying a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    IPv4(Ipv4Addr, u16),
    IPv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(_, p) | Address::IPv6(_, p) | Address::Domain(_, p) => *p,
        }
    }

    /// The RFC 1928 "unspecified" placeholder: `0.0.0.0` or `::`, any port.
    /// Callers substitute the control socket's remote IP when they see this.
    pub fn is_unspecified(&self) -> bool {
        match self {
            Address::IPv4(ip, _) => ip.is_unspecified(),
            Address::IPv6(ip, _) => ip.is_unspecified(),
            Address::Domain(_, _) => false,
        }
    }

    /// Normalizes an IPv4-mapped IPv6 address down to plain IPv4, in place.
    /// Domain addresses and genuine IPv6 addresses pass through untouched.
    pub fn normalize(mut self) -> Self {
        self.to_4();
        self
    }

    /// If this is an IPv6 address carrying an IPv4-mapped address, replaces
    /// it with the equivalent `Address::IPv4` and returns `true`.
    pub fn to_4(&mut self) -> bool {
        if let Address::IPv6(ip, port) = self {
            if let Some(v4) = ip.to_ipv4_mapped() {
                *self = Address::IPv4(v4, *port);
                return true;
            }
        }
        false
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::IPv4(ip, port) => Some(SocketAddr::V4(SocketAddrV4::new(*ip, *port))),
            Address::IPv6(ip, port) => Some(SocketAddr::V6(SocketAddrV6::new(*ip, *port, 0, 0))),
            Address::Domain(_, _) => None,
        }
    }

    /// Returns the string a `TcpStream::connect`/`lookup_host` call can use:
    /// `host:port` for every variant, domain names passed through verbatim.
    pub fn to_connect_string(&self) -> String {
        match self {
            Address::IPv4(ip, port) => format!("{ip}:{port}"),
            Address::IPv6(ip, port) => format!("[{ip}]:{port}"),
            Address::Domain(host, port) => format!("{host}:{port}"),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::IPv4(ip, port) => write!(f, "{ip}:{port}"),
            Address::IPv6(ip, port) => write!(f, "[{ip}]:{port}"),
            Address::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(v4) => Address::IPv4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => Address::IPv6(*v6.ip(), v6.port()),
        }
    }
}

impl From<(String, u16)> for Address {
    fn from((host, port): (String, u16)) -> Self {
        Address::Domain(host, port)
    }
}

/// The unspecified-address substitution rule used on both the client (for
/// the server's BIND/UDPASSOCIATE reply) and the server (for a relay
/// upstream's reply): if the address carries the unspecified IP, replace it
/// with `remote_ip`, keeping the original port.
pub fn substitute_unspecified(addr: Address, remote_ip: std::net::IpAddr) -> Address {
    if !addr.is_unspecified() {
        return addr;
    }
    let port = addr.port();
    match remote_ip {
        std::net::IpAddr::V4(ip) => Address::IPv4(ip, port),
        std::net::IpAddr::V6(ip) => Address::IPv6(ip, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_ipv4_mapped_ipv6() {
        let mapped = Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0xc000, 0x0201);
        let addr = Address::IPv6(mapped, 1080).normalize();
        assert_eq!(addr, Address::IPv4(Ipv4Addr::new(192, 0, 2, 1), 1080));
    }

    #[test]
    fn leaves_genuine_ipv6_alone() {
        let addr = Address::IPv6(Ipv6Addr::LOCALHOST, 1080).normalize();
        assert_eq!(addr, Address::IPv6(Ipv6Addr::LOCALHOST, 1080));
    }

    #[test]
    fn substitutes_unspecified_v4() {
        let addr = Address::IPv4(Ipv4Addr::UNSPECIFIED, 9);
        let out = substitute_unspecified(addr, "127.0.0.1".parse().unwrap());
        assert_eq!(out, Address::IPv4(Ipv4Addr::new(127, 0, 0, 1), 9));
    }

    #[test]
    fn leaves_specified_address_alone() {
        let addr = Address::Domain("example.com".into(), 443);
        let out = substitute_unspecified(addr.clone(), "127.0.0.1".parse().unwrap());
        assert_eq!(out, addr);
    }
}
