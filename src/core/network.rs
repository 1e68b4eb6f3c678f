//! Network topology types consumed by the policy builder
//!
//! These are snapshots handed over by the routing collaborator and the gateway
//! configuration. They carry no behaviour beyond address-family bookkeeping.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Interface name meaning "any interface"; the interface match is omitted.
pub const ALL_INTERFACES: &str = "*";

/// IP protocol stack a rule or address belongs to
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[strum(serialize = "IPv4")]
    V4,
    #[strum(serialize = "IPv6")]
    V6,
}

impl AddressFamily {
    pub const fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub const fn of_network(network: IpNetwork) -> Self {
        match network {
            IpNetwork::V4(_) => AddressFamily::V4,
            IpNetwork::V6(_) => AddressFamily::V6,
        }
    }
}

/// Transport protocol of the VPN connection
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// OpenVPN's `tcp-client` mode is plain TCP as far as filtering goes
    #[serde(alias = "tcp-client")]
    #[strum(to_string = "tcp", serialize = "tcp-client")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Remote VPN server the tunnel connects to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnEndpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

impl VpnEndpoint {
    pub const fn family(&self) -> AddressFamily {
        AddressFamily::of(self.ip)
    }
}

impl std::fmt::Display for VpnEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{ip}:{}/{}", self.port, self.protocol.as_str()),
            IpAddr::V6(ip) => write!(f, "[{ip}]:{}/{}", self.port, self.protocol.as_str()),
        }
    }
}

/// Outbound interface and source address used for traffic without a more
/// specific route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRoute {
    pub interface_name: String,
    pub assigned_ip: IpAddr,
}

impl DefaultRoute {
    pub const fn family(&self) -> AddressFamily {
        AddressFamily::of(self.assigned_ip)
    }
}

/// LAN directly attached to one of the gateway's interfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNetwork {
    pub interface_name: String,
    pub ip: IpAddr,
    pub subnet: IpNetwork,
}

/// Destination port rewrite applied in the `nat` PREROUTING chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRedirection {
    pub interface_name: String,
    pub source_port: u16,
    pub destination_port: u16,
}

/// Unique interface names of the default routes of one family, in route order.
pub fn route_interfaces(routes: &[DefaultRoute], family: AddressFamily) -> Vec<&str> {
    let mut interfaces: Vec<&str> = Vec::with_capacity(routes.len());
    for route in routes.iter().filter(|route| route.family() == family) {
        if !interfaces.contains(&route.interface_name.as_str()) {
            interfaces.push(&route.interface_name);
        }
    }
    interfaces
}
