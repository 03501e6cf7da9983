use std::fmt::{Debug, Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use anyhow::anyhow;


/// An IPv4 address and port. Endpoints are plain values, used for binding, connecting and
///  identifying remote peers.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Endpoint {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub const fn new(address: Ipv4Addr, port: u16) -> Endpoint {
        Endpoint { address, port }
    }

    /// the wildcard address, for binding to all interfaces
    pub const fn any(port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::UNSPECIFIED, port)
    }

    pub const fn localhost(port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::LOCALHOST, port)
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

impl Debug for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Endpoint> {
        let addr = SocketAddrV4::from_str(s)
            .map_err(|e| anyhow!("invalid endpoint {:?}: {}", s, e))?;
        Ok(addr.into())
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(value: SocketAddrV4) -> Self {
        Endpoint::new(*value.ip(), value.port())
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(value: Endpoint) -> Self {
        value.to_socket_addr()
    }
}

impl TryFrom<SocketAddr> for Endpoint {
    type Error = std::io::Error;

    fn try_from(value: SocketAddr) -> std::io::Result<Endpoint> {
        match value {
            SocketAddr::V4(addr) => Ok(addr.into()),
            SocketAddr::V6(addr) => match addr.ip().to_ipv4_mapped() {
                Some(v4) => Ok(Endpoint::new(v4, addr.port())),
                None => Err(std::io::Error::new(std::io::ErrorKind::Unsupported, format!("not an IPv4 address: {}", addr))),
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::localhost("127.0.0.1:8080", Endpoint::localhost(8080))]
    #[case::any("0.0.0.0:0", Endpoint::any(0))]
    #[case::multicast("239.192.100.1:9999", Endpoint::new(Ipv4Addr::new(239, 192, 100, 1), 9999))]
    #[case::max("255.255.255.255:65535", Endpoint::new(Ipv4Addr::BROADCAST, 65535))]
    fn test_parse_and_format(#[case] s: &str, #[case] expected: Endpoint) {
        let parsed: Endpoint = s.parse().unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.to_string(), s);
    }

    #[rstest]
    #[case::no_port("127.0.0.1")]
    #[case::port_too_big("127.0.0.1:65536")]
    #[case::bad_octet("256.0.0.1:80")]
    #[case::too_few_octets("10.0.1:80")]
    #[case::ipv6("[::1]:80")]
    #[case::empty("")]
    fn test_parse_invalid(#[case] s: &str) {
        assert!(s.parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_socket_addr_conversion() {
        let endpoint = Endpoint::new(Ipv4Addr::new(192, 168, 1, 10), 1234);
        let addr: SocketAddr = endpoint.into();
        assert_eq!(addr.to_string(), "192.168.1.10:1234");
        assert_eq!(Endpoint::try_from(addr).unwrap(), endpoint);

        let mapped: SocketAddr = "[::ffff:10.0.0.1]:77".parse().unwrap();
        assert_eq!(Endpoint::try_from(mapped).unwrap(), Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 77));

        let v6: SocketAddr = "[2001:db8::1]:77".parse().unwrap();
        assert!(Endpoint::try_from(v6).is_err());
    }
}
