//! Input validation for gateway configuration
//!
//! Interface names and ports end up as iptables arguments, so they are checked
//! before any rule is built from them.

use crate::core::network::{ALL_INTERFACES, VpnEndpoint};
use ipnetwork::IpNetwork;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// `*` is accepted and means every interface.
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name == ALL_INTERFACES {
        return Ok(name.to_string());
    }

    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    // Leading dash would be read as an iptables option
    if name.starts_with('-') {
        return Err("Interface name cannot start with '-'".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates the remote VPN server.
///
/// # Errors
///
/// Returns `Err` for port 0 or an unspecified/multicast server address.
pub fn validate_vpn_endpoint(endpoint: &VpnEndpoint) -> Result<(), String> {
    validate_port(endpoint.port)?;
    if endpoint.ip.is_unspecified() || endpoint.ip.is_multicast() {
        return Err(format!("{} is not a usable VPN server address", endpoint.ip));
    }
    Ok(())
}

/// Checks an outbound subnet and returns an informational warning.
///
/// Outbound subnets bypass the tunnel, so very wide ranges are worth a warning
/// but are not rejected.
pub fn check_outbound_subnet(subnet: IpNetwork) -> Option<String> {
    if subnet.prefix() == 0 {
        return Some(format!(
            "Outbound subnet {subnet} matches every address - all traffic can bypass the VPN"
        ));
    }
    if subnet.ip().is_loopback() {
        return Some("Loopback range - loopback rules already exist".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::network::Protocol;

    #[test]
    fn test_validate_port_zero() {
        assert!(validate_port(0).is_err());
    }

    #[test]
    fn test_validate_port_valid() {
        assert_eq!(validate_port(1).unwrap(), 1);
        assert_eq!(validate_port(1194).unwrap(), 1194);
        assert_eq!(validate_port(65535).unwrap(), 65535);
    }

    #[test]
    fn test_validate_interface_valid() {
        assert_eq!(validate_interface("eth0").unwrap(), "eth0");
        assert_eq!(validate_interface("tun0").unwrap(), "tun0");
        assert_eq!(validate_interface("wg-vpn.1").unwrap(), "wg-vpn.1");
        assert_eq!(validate_interface("*").unwrap(), "*");
    }

    #[test]
    fn test_validate_interface_invalid() {
        assert!(validate_interface("").is_err());
        assert!(validate_interface(".").is_err());
        assert!(validate_interface("..").is_err());
        assert!(validate_interface("averyveryverylongname").is_err());
        assert!(validate_interface("eth0;rm").is_err());
        assert!(validate_interface("eth 0").is_err());
        assert!(validate_interface("-j").is_err());
        assert!(validate_interface("eth*").is_err());
    }

    #[test]
    fn test_validate_vpn_endpoint() {
        let mut endpoint = VpnEndpoint {
            ip: "10.0.0.1".parse().unwrap(),
            port: 1194,
            protocol: Protocol::Udp,
        };
        assert!(validate_vpn_endpoint(&endpoint).is_ok());

        endpoint.port = 0;
        assert!(validate_vpn_endpoint(&endpoint).is_err());

        endpoint.port = 1194;
        endpoint.ip = "0.0.0.0".parse().unwrap();
        assert!(validate_vpn_endpoint(&endpoint).is_err());
    }

    #[test]
    fn test_check_outbound_subnet() {
        assert!(check_outbound_subnet("0.0.0.0/0".parse().unwrap()).is_some());
        assert!(check_outbound_subnet("::/0".parse().unwrap()).is_some());
        assert!(check_outbound_subnet("192.168.2.0/24".parse().unwrap()).is_none());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_interface_charset_accepted(name in "[a-z][a-z0-9._-]{0,14}") {
                prop_assert!(validate_interface(&name).is_ok());
            }

            #[test]
            fn test_interface_never_contains_whitespace(name in ".*") {
                if let Ok(valid) = validate_interface(&name) {
                    prop_assert!(!valid.chars().any(char::is_whitespace));
                    prop_assert!(valid.len() <= 15);
                }
            }

            #[test]
            fn test_nonzero_ports_valid(port in 1u16..=65535) {
                prop_assert_eq!(validate_port(port).unwrap(), port);
            }
        }
    }
}
