//! Live policy updates
//!
//! While disabled these only record the new settings, which the next enable
//! installs. While enabled they also add and remove the matching rules.

use super::Firewall;
use crate::audit::EventType;
use crate::core::error::{Error, Result, ResultExt};
use crate::core::network::{PortRedirection, VpnEndpoint};
use crate::validators;
use ipnetwork::IpNetwork;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn check_interface(field: &str, interface: &str) -> Result<()> {
    validators::validate_interface(interface)
        .map(drop)
        .map_err(|message| Error::validation(field, message))
}

impl Firewall {
    /// Replaces the VPN server (and tunnel interface) traffic may flow to.
    ///
    /// Failures removing the previous rules are logged; failures adding the
    /// new ones are returned.
    pub async fn set_vpn_connection(
        &self,
        endpoint: Option<VpnEndpoint>,
        vpn_interface: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(endpoint) = &endpoint {
            validators::validate_vpn_endpoint(endpoint)
                .map_err(|message| Error::validation("vpn.endpoint", message))?;
        }
        if let Some(interface) = vpn_interface {
            check_interface("vpn.interface", interface)?;
        }
        let vpn_interface = vpn_interface.map(str::to_string);

        let mut state = self.state.lock().await;
        if !state.enabled {
            info!("firewall disabled, only updating VPN connection internal state");
            state.vpn_connection = endpoint;
            state.vpn_interface = vpn_interface;
            return Ok(());
        }
        if state.vpn_connection == endpoint && state.vpn_interface == vpn_interface {
            return Ok(());
        }

        if let Some(endpoint) = &endpoint {
            self.check_vpn_family(endpoint)?;
        }

        info!("setting VPN connection through firewall...");
        if let Err(err) = self.set_vpn_rules(&state, true, cancel).await {
            warn!("removing previous VPN connection rules: {err}");
        }
        state.vpn_connection = endpoint;
        state.vpn_interface = vpn_interface;

        let result = self
            .set_vpn_rules(&state, false, cancel)
            .await
            .context("allowing VPN connection");
        self.audit(
            EventType::UpdateVpnConnection,
            &state,
            result.as_ref().err().map(ToString::to_string),
        )
        .await;
        result
    }

    /// Allows TCP and UDP input to `port` through `interface`.
    ///
    /// Port 0 is ignored and already allowed pairs are a no-op.
    pub async fn set_allowed_port(
        &self,
        port: u16,
        interface: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if port == 0 {
            return Ok(());
        }
        check_interface("allowed_input_ports.interfaces", interface)?;

        let mut state = self.state.lock().await;
        let already_allowed = state
            .allowed_input_ports
            .get(&port)
            .is_some_and(|interfaces| interfaces.contains(interface));
        if already_allowed {
            return Ok(());
        }

        if state.enabled {
            info!("setting allowed input port {port} through interface {interface}...");
            self.iptables
                .accept_input_to_port(interface, port, false, cancel)
                .await
                .with_context(|| {
                    format!("allowing input to port {port} through interface {interface}")
                })?;
        } else {
            info!("firewall disabled, only updating allowed ports internal state");
        }

        state
            .allowed_input_ports
            .entry(port)
            .or_default()
            .insert(interface.to_string());
        Ok(())
    }

    /// Stops allowing input to `port` on every interface it was allowed on.
    pub async fn remove_allowed_port(&self, port: u16, cancel: &CancellationToken) -> Result<()> {
        if port == 0 {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let Some(interfaces) = state.allowed_input_ports.get(&port).cloned() else {
            return Ok(());
        };

        if !state.enabled {
            info!("firewall disabled, only updating allowed ports internal state");
            state.allowed_input_ports.remove(&port);
            return Ok(());
        }

        info!("removing allowed port {port}...");
        for interface in interfaces {
            self.iptables
                .accept_input_to_port(&interface, port, true, cancel)
                .await
                .with_context(|| {
                    format!("removing allowed port {port} on interface {interface}")
                })?;
            if let Some(remaining) = state.allowed_input_ports.get_mut(&port) {
                remaining.remove(&interface);
            }
        }
        state.allowed_input_ports.remove(&port);
        Ok(())
    }

    /// Replaces the subnets reachable outside the tunnel.
    ///
    /// Subnets no longer wanted are removed first; removal failures are
    /// logged. Subnets already present are left untouched.
    pub async fn set_outbound_subnets(
        &self,
        subnets: Vec<IpNetwork>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for subnet in &subnets {
            if let Some(warning) = validators::check_outbound_subnet(*subnet) {
                warn!("{warning}");
            }
        }

        let mut state = self.state.lock().await;
        if !state.enabled {
            info!("firewall disabled, only updating allowed subnets internal state");
            state.outbound_subnets = subnets;
            return Ok(());
        }

        info!("setting allowed subnets...");
        let stale: Vec<IpNetwork> = state
            .outbound_subnets
            .iter()
            .filter(|subnet| !subnets.contains(*subnet))
            .copied()
            .collect();
        for subnet in stale {
            if let Err(err) = self
                .accept_outbound_subnet(&state, subnet, true, cancel)
                .await
            {
                warn!("removing outbound subnet {subnet}: {err}");
            }
            state.outbound_subnets.retain(|s| *s != subnet);
        }

        for subnet in subnets {
            if state.outbound_subnets.contains(&subnet) {
                continue;
            }
            self.accept_outbound_subnet(&state, subnet, false, cancel)
                .await
                .with_context(|| format!("setting allowed outbound subnet {subnet}"))?;
            state.outbound_subnets.push(subnet);
        }
        Ok(())
    }

    /// Redirects `source_port` to `destination_port` on `interface`.
    ///
    /// A `destination_port` of 0 removes the redirection of `source_port`. A
    /// different destination replaces the existing redirection.
    pub async fn redirect_port(
        &self,
        interface: &str,
        source_port: u16,
        destination_port: u16,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if source_port == 0 {
            return Err(Error::validation(
                "port_redirections.source_port",
                "source port cannot be 0",
            ));
        }
        check_interface("port_redirections.interface_name", interface)?;

        let mut state = self.state.lock().await;
        let existing = state
            .port_redirections
            .iter()
            .position(|r| r.interface_name == interface && r.source_port == source_port);

        if let Some(index) = existing {
            let old = state.port_redirections[index].clone();
            if old.destination_port == destination_port {
                return Ok(());
            }
            if state.enabled {
                self.iptables
                    .redirect_port(
                        &old.interface_name,
                        old.source_port,
                        old.destination_port,
                        true,
                        cancel,
                    )
                    .await
                    .context("removing previous port redirection")?;
            }
            state.port_redirections.remove(index);
        }

        if destination_port == 0 {
            return Ok(());
        }

        if state.enabled {
            self.iptables
                .redirect_port(interface, source_port, destination_port, false, cancel)
                .await
                .context("redirecting port")?;
        } else {
            info!("firewall disabled, only updating port redirections internal state");
        }
        state.port_redirections.push(PortRedirection {
            interface_name: interface.to_string(),
            source_port,
            destination_port,
        });
        Ok(())
    }
}
