//! Gateway configuration
//!
//! A single JSON file describes the topology and the desired policy:
//!
//! ```json
//! {
//!   "default_routes": [{ "interface_name": "tun0", "assigned_ip": "10.8.0.2" }],
//!   "local_networks": [
//!     { "interface_name": "eth0", "ip": "192.168.1.5", "subnet": "192.168.1.0/24" }
//!   ],
//!   "vpn": {
//!     "endpoint": { "ip": "10.0.0.1", "port": 1194, "protocol": "udp" },
//!     "interface": "tun0"
//!   },
//!   "allowed_input_ports": [{ "port": 8080, "interfaces": ["eth0"] }]
//! }
//! ```
//!
//! Without `--config`, `config.json` in the XDG config directory is used, and
//! a missing file there means an empty policy.

use crate::core::error::{Error, Result, ResultExt};
use crate::core::firewall::{DEFAULT_POST_RULES_PATH, Firewall};
use crate::core::network::{DefaultRoute, LocalNetwork, PortRedirection, VpnEndpoint};
use crate::core::routing::StaticRouting;
use crate::utils::get_config_dir;
use crate::validators;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub firewall: FirewallSettings,
    pub default_routes: Vec<DefaultRoute>,
    pub local_networks: Vec<LocalNetwork>,
    /// Subnets reachable outside the tunnel
    pub outbound_subnets: Vec<IpNetwork>,
    pub vpn: Option<VpnSettings>,
    pub allowed_input_ports: Vec<AllowedPort>,
    pub port_redirections: Vec<PortRedirection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallSettings {
    #[serde(default = "default_post_rules_path")]
    pub post_rules_path: PathBuf,
}

impl Default for FirewallSettings {
    fn default() -> Self {
        Self {
            post_rules_path: default_post_rules_path(),
        }
    }
}

/// Packagers may relocate the post-rules file at build time.
fn default_post_rules_path() -> PathBuf {
    PathBuf::from(option_env!("TUNWALL_POST_RULES_PATH").unwrap_or(DEFAULT_POST_RULES_PATH))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnSettings {
    pub endpoint: VpnEndpoint,
    /// Tunnel interface, e.g. `tun0`
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedPort {
    pub port: u16,
    pub interfaces: Vec<String>,
}

impl GatewayConfig {
    /// Checks every interface name and port before any rule is built.
    pub fn validate(&self) -> Result<()> {
        let interface = |field: &str, name: &str| {
            validators::validate_interface(name)
                .map(drop)
                .map_err(|message| Error::validation(field, format!("{name:?}: {message}")))
        };

        for route in &self.default_routes {
            interface("default_routes.interface_name", &route.interface_name)?;
        }
        for network in &self.local_networks {
            interface("local_networks.interface_name", &network.interface_name)?;
            if !network.subnet.contains(network.ip) {
                warn!(
                    "local network address {} is outside its subnet {}",
                    network.ip, network.subnet
                );
            }
        }
        if let Some(vpn) = &self.vpn {
            validators::validate_vpn_endpoint(&vpn.endpoint)
                .map_err(|message| Error::validation("vpn.endpoint", message))?;
            if let Some(name) = &vpn.interface {
                interface("vpn.interface", name)?;
            }
        }
        for allowed in &self.allowed_input_ports {
            validators::validate_port(allowed.port)
                .map_err(|message| Error::validation("allowed_input_ports.port", message))?;
            for name in &allowed.interfaces {
                interface("allowed_input_ports.interfaces", name)?;
            }
        }
        for redirection in &self.port_redirections {
            interface("port_redirections.interface_name", &redirection.interface_name)?;
            validators::validate_port(redirection.source_port).map_err(|message| {
                Error::validation("port_redirections.source_port", message)
            })?;
            validators::validate_port(redirection.destination_port).map_err(|message| {
                Error::validation("port_redirections.destination_port", message)
            })?;
        }
        Ok(())
    }

    /// Topology for the routing collaborator.
    pub fn routing(&self) -> StaticRouting {
        StaticRouting::new(self.default_routes.clone(), self.local_networks.clone())
    }

    /// Hands the desired policy to a (still disabled) controller.
    pub async fn seed_firewall(&self, firewall: &Firewall, cancel: &CancellationToken) -> Result<()> {
        if let Some(vpn) = &self.vpn {
            firewall
                .set_vpn_connection(Some(vpn.endpoint), vpn.interface.as_deref(), cancel)
                .await?;
        }
        for allowed in &self.allowed_input_ports {
            for interface in &allowed.interfaces {
                firewall
                    .set_allowed_port(allowed.port, interface, cancel)
                    .await?;
            }
        }
        firewall
            .set_outbound_subnets(self.outbound_subnets.clone(), cancel)
            .await?;
        for redirection in &self.port_redirections {
            firewall
                .redirect_port(
                    &redirection.interface_name,
                    redirection.source_port,
                    redirection.destination_port,
                    cancel,
                )
                .await?;
        }
        Ok(())
    }
}

/// Location of the default configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads and validates the configuration.
///
/// An explicit `path` must exist. Without one, a missing default file yields
/// an empty configuration.
pub async fn load_config(path: Option<&Path>) -> Result<GatewayConfig> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => match default_config_path() {
            Some(path) => (path, false),
            None => return Ok(GatewayConfig::default()),
        },
    };

    let json = match tokio::fs::read_to_string(&path).await {
        Ok(json) => json,
        Err(err) if !explicit && err.kind() == std::io::ErrorKind::NotFound => {
            info!("no configuration at {}, using defaults", path.display());
            return Ok(GatewayConfig::default());
        }
        Err(err) => {
            return Err(Error::Io(err))
                .with_context(|| format!("reading configuration {}", path.display()));
        }
    };

    let config: GatewayConfig = serde_json::from_str(&json)
        .map_err(Error::from)
        .with_context(|| format!("parsing configuration {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::network::Protocol;
    use std::io::Write;

    const EXAMPLE: &str = r#"{
        "firewall": { "post_rules_path": "/etc/tunwall/post-rules.txt" },
        "default_routes": [{ "interface_name": "tun0", "assigned_ip": "10.8.0.2" }],
        "local_networks": [
            { "interface_name": "eth0", "ip": "192.168.1.5", "subnet": "192.168.1.0/24" }
        ],
        "outbound_subnets": ["192.168.2.0/24"],
        "vpn": {
            "endpoint": { "ip": "10.0.0.1", "port": 1194, "protocol": "udp" },
            "interface": "tun0"
        },
        "allowed_input_ports": [{ "port": 8080, "interfaces": ["eth0", "tun0"] }],
        "port_redirections": [
            { "interface_name": "tun0", "source_port": 51413, "destination_port": 51413 }
        ]
    }"#;

    #[test]
    fn test_parse_full_config() {
        let config: GatewayConfig = serde_json::from_str(EXAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(
            config.firewall.post_rules_path,
            PathBuf::from("/etc/tunwall/post-rules.txt")
        );
        let vpn = config.vpn.unwrap();
        assert_eq!(vpn.endpoint.protocol, Protocol::Udp);
        assert_eq!(vpn.interface.as_deref(), Some("tun0"));
        assert_eq!(config.allowed_input_ports[0].interfaces.len(), 2);
        assert_eq!(config.port_redirections[0].source_port, 51413);
    }

    #[test]
    fn test_empty_config_defaults() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert!(config.vpn.is_none());
        assert!(config.default_routes.is_empty());
        assert_eq!(config.firewall.post_rules_path, default_post_rules_path());
    }

    #[test]
    fn test_validate_rejects_bad_interface() {
        let mut config: GatewayConfig = serde_json::from_str(EXAMPLE).unwrap();
        config.allowed_input_ports[0].interfaces.push("eth0; rm".to_string());
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "allowed_input_ports.interfaces"));
    }

    #[test]
    fn test_validate_rejects_zero_redirection_port() {
        let mut config: GatewayConfig = serde_json::from_str(EXAMPLE).unwrap();
        config.port_redirections[0].destination_port = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(EXAMPLE.as_bytes()).unwrap();
        let config = load_config(Some(file.path())).await.unwrap();
        assert_eq!(config.local_networks.len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("nope.json"))).await;
        assert!(matches!(result.unwrap_err().root(), Error::Io(_)));
    }

    #[tokio::test]
    async fn test_load_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        let err = load_config(Some(file.path())).await.unwrap_err();
        assert!(matches!(err.root(), Error::Serialization(_)));
        assert!(err.to_string().starts_with("parsing configuration"));
    }
}
