//! Firewall operations built on top of the executor
//!
//! Each operation takes `remove` so installing and uninstalling share the
//! same match criteria. Operations touching both families are applied per
//! instruction, IPv4 first.

use super::instruction::{Chain, IPV6_SOLICITED_NODE_MULTICAST, Instruction, Policy, Target};
use super::{Iptables, Revert};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::network::{AddressFamily, Protocol, VpnEndpoint};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tokio_util::sync::CancellationToken;
use tracing::warn;

fn parse_policy(policy: &str) -> Result<Policy> {
    policy
        .parse()
        .map_err(|_| Error::PolicyUnknown(policy.to_string()))
}

impl Iptables {
    /// Sets the policy of INPUT, OUTPUT and FORWARD for IPv4.
    ///
    /// Only `ACCEPT` and `DROP` are accepted; anything else fails before any
    /// command is issued.
    pub async fn set_ipv4_all_policies(
        &self,
        policy: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let policy = parse_policy(policy)?;
        self.run_ipv4_instructions(&Instruction::all_policies(policy), cancel)
            .await
    }

    /// IPv6 variant of [`Iptables::set_ipv4_all_policies`]; a no-op without
    /// an IPv6 engine.
    pub async fn set_ipv6_all_policies(
        &self,
        policy: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let policy = parse_policy(policy)?;
        self.run_ipv6_instructions(&Instruction::all_policies(policy), cancel)
            .await
    }

    pub async fn accept_input_through_interface(
        &self,
        interface: &str,
        remove: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let instruction = Instruction::append_or_delete(remove, Chain::Input)
            .in_interface(interface)
            .jump(Target::Accept);
        self.run_mixed_instructions(&[instruction], cancel).await
    }

    pub async fn accept_output_through_interface(
        &self,
        interface: &str,
        remove: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let instruction = Instruction::append_or_delete(remove, Chain::Output)
            .out_interface(interface)
            .jump(Target::Accept);
        self.run_mixed_instructions(&[instruction], cancel).await
    }

    /// Accepts packets of tracked connections, output first.
    pub async fn accept_established_related_traffic(
        &self,
        remove: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let instructions = [Chain::Output, Chain::Input].map(|chain| {
            Instruction::append_or_delete(remove, chain)
                .conntrack_states("ESTABLISHED,RELATED")
                .jump(Target::Accept)
        });
        self.run_mixed_instructions(&instructions, cancel).await
    }

    /// Accepts output to the VPN server through the given interface.
    ///
    /// An IPv6 endpoint without an IPv6 engine is an error.
    pub async fn accept_output_traffic_to_vpn(
        &self,
        interface: &str,
        endpoint: &VpnEndpoint,
        remove: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let instruction = Instruction::append_or_delete(remove, Chain::Output)
            .destination(endpoint.ip)
            .out_interface(interface)
            .protocol_match(endpoint.protocol)
            .destination_port(endpoint.port)
            .jump(Target::Accept);
        self.run_family_instructions(
            endpoint.family(),
            &[instruction],
            || format!("VPN connection {endpoint}"),
            cancel,
        )
        .await
    }

    pub async fn accept_output_from_ip_to_subnet(
        &self,
        interface: &str,
        source: IpAddr,
        subnet: IpNetwork,
        remove: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let family = AddressFamily::of_network(subnet);
        if AddressFamily::of(source) != family {
            return Err(Error::validation(
                "subnet",
                format!("source {source} and subnet {subnet} are not the same IP family"),
            ));
        }
        let instruction = Instruction::append_or_delete(remove, Chain::Output)
            .out_interface(interface)
            .source(source)
            .destination(subnet)
            .jump(Target::Accept);
        self.run_family_instructions(
            family,
            &[instruction],
            || format!("subnet {subnet}"),
            cancel,
        )
        .await
    }

    pub async fn accept_input_to_subnet(
        &self,
        interface: &str,
        subnet: IpNetwork,
        remove: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let instruction = Instruction::append_or_delete(remove, Chain::Input)
            .in_interface(interface)
            .destination(subnet)
            .jump(Target::Accept);
        self.run_family_instructions(
            AddressFamily::of_network(subnet),
            &[instruction],
            || format!("subnet {subnet}"),
            cancel,
        )
        .await
    }

    /// Accepts neighbour discovery multicast output; a no-op without IPv6.
    pub async fn accept_ipv6_multicast_output(
        &self,
        interface: &str,
        remove: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let instruction = Instruction::append_or_delete(remove, Chain::Output)
            .out_interface(interface)
            .destination(IPV6_SOLICITED_NODE_MULTICAST)
            .jump(Target::Accept);
        self.run_ipv6_instructions(&[instruction], cancel).await
    }

    /// Accepts TCP and UDP input to a port, both families.
    pub async fn accept_input_to_port(
        &self,
        interface: &str,
        port: u16,
        remove: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let instructions = [Protocol::Tcp, Protocol::Udp].map(|protocol| {
            Instruction::append_or_delete(remove, Chain::Input)
                .in_interface(interface)
                .protocol_match(protocol)
                .destination_port(port)
                .jump(Target::Accept)
        });
        self.run_mixed_instructions(&instructions, cancel).await
    }

    /// Redirects `source_port` to `destination_port` on an interface, for
    /// TCP and UDP, and accepts input to the destination port.
    ///
    /// If the kernel has no IPv6 NAT table only the IPv6 half is rolled back
    /// and the IPv4 redirection stays in place.
    pub async fn redirect_port(
        &self,
        interface: &str,
        source_port: u16,
        destination_port: u16,
        remove: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let instructions =
            Instruction::port_redirection(interface, source_port, destination_port, remove);

        let (ipv4, ipv6) = self.lock_both().await;
        let restore = self.save_locked(&ipv4, ipv6.as_ref(), cancel).await?;

        if let Err(err) = ipv4
            .run_all(self.runner.as_ref(), &instructions, cancel)
            .await
        {
            restore.revert().await;
            return Err(err).with_context(|| {
                format!(
                    "redirecting IPv4 source port {source_port} to destination port {destination_port} on interface {interface}"
                )
            });
        }

        let Some(ipv6) = ipv6.as_ref() else {
            return Ok(());
        };
        match ipv6
            .run_all(self.runner.as_ref(), &instructions, cancel)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_ipv6_nat_unavailable() => {
                restore.only(AddressFamily::V6).revert().await;
                if !remove {
                    warn!(
                        "IPv6 port redirection disabled because your kernel does not support IPv6 NAT: {err}"
                    );
                }
                Ok(())
            }
            Err(err) => {
                restore.revert().await;
                Err(err).with_context(|| {
                    format!(
                        "redirecting IPv6 source port {source_port} to destination port {destination_port} on interface {interface}"
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::iptables::Iptables;
    use crate::core::memory::MemoryEngine;
    use crate::core::error::Error;
    use crate::core::network::{AddressFamily, Protocol, VpnEndpoint};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn setup(engine: MemoryEngine) -> (Arc<MemoryEngine>, Iptables) {
        let engine = Arc::new(engine);
        let iptables = Iptables::new(engine.clone(), &CancellationToken::new())
            .await
            .unwrap();
        engine.clear_history();
        (engine, iptables)
    }

    #[tokio::test]
    async fn test_invalid_policy_issues_no_commands() {
        let (engine, iptables) = setup(MemoryEngine::new()).await;
        let cancel = CancellationToken::new();

        let err = iptables
            .set_ipv4_all_policies("REJECT", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PolicyUnknown(ref p) if p == "REJECT"));
        let err = iptables
            .set_ipv6_all_policies("", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PolicyUnknown(_)));
        assert_eq!(engine.command_count(), 0);
    }

    #[tokio::test]
    async fn test_set_policies() {
        let (engine, iptables) = setup(MemoryEngine::new()).await;
        let cancel = CancellationToken::new();
        iptables.set_ipv4_all_policies("DROP", &cancel).await.unwrap();

        for chain in ["INPUT", "OUTPUT", "FORWARD"] {
            assert_eq!(engine.policy(AddressFamily::V4, chain).as_deref(), Some("DROP"));
            assert_eq!(engine.policy(AddressFamily::V6, chain).as_deref(), Some("ACCEPT"));
        }
    }

    #[tokio::test]
    async fn test_accept_input_to_port_round_trip() {
        let (engine, iptables) = setup(MemoryEngine::new()).await;
        let cancel = CancellationToken::new();
        let before_v4 = engine.dump(AddressFamily::V4);
        let before_v6 = engine.dump(AddressFamily::V6);

        iptables
            .accept_input_to_port("eth0", 8080, false, &cancel)
            .await
            .unwrap();
        assert_eq!(
            engine.rules(AddressFamily::V4, "filter", "INPUT"),
            vec![
                "-i eth0 -p tcp -m tcp --dport 8080 -j ACCEPT",
                "-i eth0 -p udp -m udp --dport 8080 -j ACCEPT",
            ]
        );
        assert_eq!(engine.rules(AddressFamily::V6, "filter", "INPUT").len(), 2);

        iptables
            .accept_input_to_port("eth0", 8080, true, &cancel)
            .await
            .unwrap();
        assert_eq!(engine.dump(AddressFamily::V4), before_v4);
        assert_eq!(engine.dump(AddressFamily::V6), before_v6);
    }

    #[tokio::test]
    async fn test_mixed_failure_reverts_both_families() {
        let (engine, iptables) = setup(MemoryEngine::new()).await;
        let cancel = CancellationToken::new();
        let before_v4 = engine.dump(AddressFamily::V4);
        engine.fail_when("ip6tables --append INPUT -i eth0 -p udp");

        let result = iptables
            .accept_input_to_port("eth0", 53, false, &cancel)
            .await;
        assert!(result.is_err());
        assert_eq!(engine.dump(AddressFamily::V4), before_v4);
        assert!(engine.rules(AddressFamily::V6, "filter", "INPUT").is_empty());
    }

    #[tokio::test]
    async fn test_vpn_rule_format() {
        let (engine, iptables) = setup(MemoryEngine::new()).await;
        let endpoint = VpnEndpoint {
            ip: "10.0.0.1".parse().unwrap(),
            port: 1194,
            protocol: Protocol::Udp,
        };
        iptables
            .accept_output_traffic_to_vpn("eth0", &endpoint, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            engine.rules(AddressFamily::V4, "filter", "OUTPUT"),
            vec!["-d 10.0.0.1 -o eth0 -p udp -m udp --dport 1194 -j ACCEPT"]
        );
        assert!(engine.rules(AddressFamily::V6, "filter", "OUTPUT").is_empty());
    }

    #[tokio::test]
    async fn test_ipv6_vpn_without_ip6tables() {
        let (_engine, iptables) = setup(MemoryEngine::new().without_ipv6()).await;
        let endpoint = VpnEndpoint {
            ip: "2001:db8::1".parse().unwrap(),
            port: 1194,
            protocol: Protocol::Tcp,
        };
        let err = iptables
            .accept_output_traffic_to_vpn("eth0", &endpoint, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NeedIp6tables(_)));
    }

    #[tokio::test]
    async fn test_subnet_family_mismatch() {
        let (engine, iptables) = setup(MemoryEngine::new()).await;
        let err = iptables
            .accept_output_from_ip_to_subnet(
                "eth0",
                "192.168.1.5".parse().unwrap(),
                "fd00::/64".parse().unwrap(),
                false,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(engine.command_count(), 0);
    }

    #[tokio::test]
    async fn test_all_interfaces_has_no_interface_match() {
        let (engine, iptables) = setup(MemoryEngine::new()).await;
        iptables
            .accept_input_to_subnet("*", "10.0.0.0/8".parse().unwrap(), false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            engine.rules(AddressFamily::V4, "filter", "INPUT"),
            vec!["-d 10.0.0.0/8 -j ACCEPT"]
        );
    }

    #[tokio::test]
    async fn test_multicast_skipped_without_ipv6() {
        let (engine, iptables) = setup(MemoryEngine::new().without_ipv6()).await;
        iptables
            .accept_ipv6_multicast_output("eth0", false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(engine.command_count(), 0);
    }

    #[tokio::test]
    async fn test_redirect_port_without_ipv6_nat() {
        let (engine, iptables) = setup(MemoryEngine::new().without_ipv6_nat()).await;
        let before_v6 = engine.dump(AddressFamily::V6);

        iptables
            .redirect_port("tun0", 51413, 51413, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            engine.rules(AddressFamily::V4, "nat", "PREROUTING"),
            vec![
                "-i tun0 -p tcp --dport 51413 -j REDIRECT --to-ports 51413",
                "-i tun0 -p udp --dport 51413 -j REDIRECT --to-ports 51413",
            ]
        );
        assert_eq!(engine.rules(AddressFamily::V4, "filter", "INPUT").len(), 2);
        assert_eq!(engine.dump(AddressFamily::V6), before_v6);
    }

    #[tokio::test]
    async fn test_redirect_port_ipv4_failure_reverts_both() {
        let (engine, iptables) = setup(MemoryEngine::new()).await;
        let before_v4 = engine.dump(AddressFamily::V4);
        engine.fail_when("iptables -t nat --append PREROUTING -i tun0 -p udp");

        let err = iptables
            .redirect_port("tun0", 8000, 9000, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with(
            "redirecting IPv4 source port 8000 to destination port 9000 on interface tun0"
        ));
        assert_eq!(engine.dump(AddressFamily::V4), before_v4);
    }
}
