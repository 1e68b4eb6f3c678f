//! Kill-switch policy installation
//!
//! Everything is dropped by default. Traffic is then accepted only for
//! loopback, tracked connections, the VPN server, attached LANs, configured
//! outbound subnets, allowed input ports and port redirections, followed by
//! the user post-rules.

use super::{Firewall, FirewallState};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::iptables::Revert;
use crate::core::network::{AddressFamily, VpnEndpoint, route_interfaces};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

impl Firewall {
    /// Refreshes the topology, snapshots the rules and installs the policy.
    /// Any failure after the snapshot rolls back to it.
    pub(super) async fn enable(
        &self,
        state: &mut FirewallState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        state.default_routes = self
            .routing
            .default_routes()
            .await
            .context("reading default routes")?;
        state.local_networks = self
            .routing
            .local_networks()
            .await
            .context("reading local networks")?;

        let restore = self
            .iptables
            .save_and_restore(cancel)
            .await
            .context("saving firewall rules")?;

        if let Err(err) = self.apply_policy(state, cancel).await {
            restore.revert().await;
            return Err(err);
        }
        state.restore = Some(restore);
        Ok(())
    }

    async fn apply_policy(&self, state: &FirewallState, cancel: &CancellationToken) -> Result<()> {
        const REMOVE: bool = false;
        let iptables = &self.iptables;

        iptables
            .set_ipv4_all_policies("DROP", cancel)
            .await
            .context("setting IPv4 policies to DROP")?;
        iptables
            .set_ipv6_all_policies("DROP", cancel)
            .await
            .context("setting IPv6 policies to DROP")?;

        iptables
            .accept_input_through_interface("lo", REMOVE, cancel)
            .await
            .context("accepting loopback input")?;
        iptables
            .accept_output_through_interface("lo", REMOVE, cancel)
            .await
            .context("accepting loopback output")?;

        iptables
            .accept_established_related_traffic(REMOVE, cancel)
            .await
            .context("accepting established and related traffic")?;

        self.set_vpn_rules(state, REMOVE, cancel).await?;

        let mut seen_interfaces = BTreeSet::new();
        for network in &state.local_networks {
            iptables
                .accept_output_from_ip_to_subnet(
                    &network.interface_name,
                    network.ip,
                    network.subnet,
                    REMOVE,
                    cancel,
                )
                .await
                .with_context(|| {
                    format!(
                        "accepting output from {} to local subnet {}",
                        network.ip, network.subnet
                    )
                })?;

            if seen_interfaces.insert(network.interface_name.as_str()) {
                iptables
                    .accept_ipv6_multicast_output(&network.interface_name, REMOVE, cancel)
                    .await
                    .context("accepting IPv6 multicast output")?;
            }
        }

        for subnet in &state.outbound_subnets {
            self.accept_outbound_subnet(state, *subnet, REMOVE, cancel)
                .await?;
        }

        for network in &state.local_networks {
            iptables
                .accept_input_to_subnet(&network.interface_name, network.subnet, REMOVE, cancel)
                .await
                .with_context(|| {
                    format!(
                        "accepting input to local subnet {} on interface {}",
                        network.subnet, network.interface_name
                    )
                })?;
        }

        for (port, interfaces) in &state.allowed_input_ports {
            for interface in interfaces {
                iptables
                    .accept_input_to_port(interface, *port, REMOVE, cancel)
                    .await
                    .with_context(|| {
                        format!("accepting input port {port} on interface {interface}")
                    })?;
            }
        }

        for redirection in &state.port_redirections {
            iptables
                .redirect_port(
                    &redirection.interface_name,
                    redirection.source_port,
                    redirection.destination_port,
                    REMOVE,
                    cancel,
                )
                .await
                .context("redirecting ports")?;
        }

        iptables
            .run_user_post_rules(&self.post_rules_path, cancel)
            .await
            .context("running user defined post firewall rules")?;

        Ok(())
    }

    /// Accepts output to the VPN server on every interface holding a default
    /// route of the server's family, and output through the tunnel itself.
    pub(super) async fn set_vpn_rules(
        &self,
        state: &FirewallState,
        remove: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(endpoint) = &state.vpn_connection {
            self.check_vpn_family(endpoint)?;
            let interfaces = route_interfaces(&state.default_routes, endpoint.family());
            if interfaces.is_empty() {
                info!(
                    "no {} default route to reach VPN server {endpoint}",
                    endpoint.family()
                );
            }
            for interface in interfaces {
                self.iptables
                    .accept_output_traffic_to_vpn(interface, endpoint, remove, cancel)
                    .await
                    .with_context(|| {
                        format!("accepting output traffic to VPN server {endpoint} through {interface}")
                    })?;
            }
        }

        if let Some(interface) = &state.vpn_interface {
            self.iptables
                .accept_output_through_interface(interface, remove, cancel)
                .await
                .with_context(|| format!("accepting output through VPN interface {interface}"))?;
        }
        Ok(())
    }

    /// An IPv6 server needs ip6tables even when no IPv6 route exists yet.
    pub(super) fn check_vpn_family(&self, endpoint: &VpnEndpoint) -> Result<()> {
        if endpoint.family() == AddressFamily::V6 && !self.iptables.ipv6_supported() {
            return Err(Error::NeedIp6tables(format!("VPN connection {endpoint}")));
        }
        Ok(())
    }

    /// Opens an outbound subnet from every default route of its family.
    /// Without such a route the subnet is skipped with an info log.
    pub(super) async fn accept_outbound_subnet(
        &self,
        state: &FirewallState,
        subnet: ipnetwork::IpNetwork,
        remove: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let family = AddressFamily::of_network(subnet);
        let mut matched = false;
        for route in state.default_routes.iter().filter(|r| r.family() == family) {
            matched = true;
            self.iptables
                .accept_output_from_ip_to_subnet(
                    &route.interface_name,
                    route.assigned_ip,
                    subnet,
                    remove,
                    cancel,
                )
                .await
                .with_context(|| {
                    format!(
                        "accepting output from {} to outbound subnet {subnet}",
                        route.assigned_ip
                    )
                })?;
        }
        if !matched {
            info!(
                "ignoring outbound subnet {subnet} since no {family} default route exists"
            );
        }
        Ok(())
    }
}
