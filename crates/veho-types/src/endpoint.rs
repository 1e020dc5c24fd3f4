//! Network endpoint identity.
//!
//! Endpoints are content-addressed: two values with the same address, port
//! and protocol compare equal and may share connection state. Sharing between
//! the routing core and the endpoint engine happens through `Arc<Endpoint>`;
//! the tuple itself stays plain data.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Transport protocol of an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportProtocol {
    /// Unreliable datagram transport.
    Udp,
    /// Reliable stream transport.
    Tcp,
    /// Host-local socket between routing host and applications.
    Local,
}

/// IP version of an endpoint address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpVersion {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

/// A transport endpoint: `(address, port, protocol)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// IP address (for `Local`, the unspecified address).
    pub address: IpAddr,
    /// Port (for `Local`, the peer's client id).
    pub port: u16,
    /// Transport protocol.
    pub protocol: TransportProtocol,
}

impl Endpoint {
    /// UDP endpoint.
    pub fn udp(address: IpAddr, port: u16) -> Self {
        Self { address, port, protocol: TransportProtocol::Udp }
    }

    /// TCP endpoint.
    pub fn tcp(address: IpAddr, port: u16) -> Self {
        Self { address, port, protocol: TransportProtocol::Tcp }
    }

    /// Host-local endpoint addressed by client id.
    pub fn local(client: u16) -> Self {
        Self {
            address: IpAddr::from([0u8, 0, 0, 0]),
            port: client,
            protocol: TransportProtocol::Local,
        }
    }

    /// The IP version of the address.
    pub fn ip_version(&self) -> IpVersion {
        match self.address {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    /// True for the reliable stream transport.
    pub fn is_reliable(&self) -> bool {
        self.protocol == TransportProtocol::Tcp
    }

    /// Socket address for the network transports.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// True if the address is a multicast group.
    pub fn is_multicast(&self) -> bool {
        self.address.is_multicast()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            TransportProtocol::Udp => "udp",
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Local => "local",
        };
        write!(f, "{proto}://{}:{}", self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_content_addressing() {
        let a = Endpoint::udp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 30509);
        let b = Endpoint::udp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 30509);
        let c = Endpoint::tcp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 30509);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_reliability_follows_protocol() {
        let tcp = Endpoint::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), 30509);
        let udp = Endpoint::udp(IpAddr::V4(Ipv4Addr::LOCALHOST), 30509);
        assert!(tcp.is_reliable());
        assert!(!udp.is_reliable());
        assert!(!Endpoint::local(0x1234).is_reliable());
    }

    #[test]
    fn test_display() {
        let e = Endpoint::udp(IpAddr::V4(Ipv4Addr::new(224, 244, 224, 245)), 30490);
        assert_eq!(e.to_string(), "udp://224.244.224.245:30490");
        assert!(e.is_multicast());
    }
}
