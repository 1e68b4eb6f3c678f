//! Typed builder for iptables command-line instructions
//!
//! An [`Instruction`] is the argument list given to `iptables`/`ip6tables`,
//! for example `--append INPUT -i lo -j ACCEPT`. Builders take a `remove`
//! flag so that installing and uninstalling a rule share one code path.

use crate::core::network::{ALL_INTERFACES, Protocol};
use std::fmt;

/// Multicast range used by IPv6 neighbour discovery (solicited-node addresses)
pub const IPV6_SOLICITED_NODE_MULTICAST: &str = "ff02::1:ff00:0/104";

/// Built-in chains the firewall manipulates
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum Chain {
    #[strum(serialize = "INPUT")]
    Input,
    #[strum(serialize = "OUTPUT")]
    Output,
    #[strum(serialize = "FORWARD")]
    Forward,
    #[strum(serialize = "PREROUTING")]
    Prerouting,
}

/// Default action of a built-in chain
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::AsRefStr,
)]
pub enum Policy {
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
}

/// Jump targets used by the policy builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum Target {
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
}

/// One iptables invocation expressed as its ordered argument tokens
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Instruction {
    tokens: Vec<String>,
}

impl Instruction {
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// Splits a shell-style line on whitespace, without quote handling.
    pub fn parse(text: &str) -> Self {
        Self::from_tokens(text.split_whitespace())
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// `--append CHAIN` or `--delete CHAIN` in the filter table.
    pub fn append_or_delete(remove: bool, chain: Chain) -> Self {
        Self::default().token(operation(remove)).token(chain.as_ref())
    }

    /// `-t nat --append CHAIN` or `-t nat --delete CHAIN`.
    pub fn nat(remove: bool, chain: Chain) -> Self {
        Self::from_tokens(["-t", "nat"])
            .token(operation(remove))
            .token(chain.as_ref())
    }

    /// `--policy CHAIN POLICY`.
    pub fn policy(chain: Chain, policy: Policy) -> Self {
        Self::from_tokens(["--policy", chain.as_ref(), policy.as_ref()])
    }

    fn token(mut self, token: impl Into<String>) -> Self {
        self.tokens.push(token.into());
        self
    }

    fn interface(self, flag: &str, interface: &str) -> Self {
        // Some engines reject an explicit wildcard, so "all" means no match at all
        if interface == ALL_INTERFACES {
            self
        } else {
            self.token(flag).token(interface)
        }
    }

    pub fn in_interface(self, interface: &str) -> Self {
        self.interface("-i", interface)
    }

    pub fn out_interface(self, interface: &str) -> Self {
        self.interface("-o", interface)
    }

    pub fn source(self, source: impl fmt::Display) -> Self {
        self.token("-s").token(source.to_string())
    }

    pub fn destination(self, destination: impl fmt::Display) -> Self {
        self.token("-d").token(destination.to_string())
    }

    pub fn protocol(self, protocol: Protocol) -> Self {
        self.token("-p").token(protocol.as_str())
    }

    /// `-p proto -m proto`, needed before `--dport` in the filter table.
    pub fn protocol_match(self, protocol: Protocol) -> Self {
        self.protocol(protocol).token("-m").token(protocol.as_str())
    }

    pub fn destination_port(self, port: u16) -> Self {
        self.token("--dport").token(port.to_string())
    }

    pub fn conntrack_states(self, states: &str) -> Self {
        self.token("-m")
            .token("conntrack")
            .token("--ctstate")
            .token(states)
    }

    pub fn jump(self, target: Target) -> Self {
        self.token("-j").token(target.as_ref())
    }

    pub fn redirect_to_port(self, port: u16) -> Self {
        self.token("-j")
            .token("REDIRECT")
            .token("--to-ports")
            .token(port.to_string())
    }

    /// DROP or ACCEPT policy on INPUT, OUTPUT and FORWARD.
    pub fn all_policies(policy: Policy) -> Vec<Self> {
        [Chain::Input, Chain::Output, Chain::Forward]
            .into_iter()
            .map(|chain| Self::policy(chain, policy))
            .collect()
    }

    /// NAT redirect plus INPUT accept of the destination port, TCP then UDP.
    pub fn port_redirection(
        interface: &str,
        source_port: u16,
        destination_port: u16,
        remove: bool,
    ) -> Vec<Self> {
        [Protocol::Tcp, Protocol::Udp]
            .into_iter()
            .flat_map(|protocol| {
                [
                    Self::nat(remove, Chain::Prerouting)
                        .in_interface(interface)
                        .protocol(protocol)
                        .destination_port(source_port)
                        .redirect_to_port(destination_port),
                    Self::append_or_delete(remove, Chain::Input)
                        .in_interface(interface)
                        .protocol_match(protocol)
                        .destination_port(destination_port)
                        .jump(Target::Accept),
                ]
            })
            .collect()
    }
}

const fn operation(remove: bool) -> &'static str {
    if remove { "--delete" } else { "--append" }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_input() {
        let instruction = Instruction::append_or_delete(false, Chain::Input)
            .in_interface("lo")
            .jump(Target::Accept);
        assert_eq!(instruction.to_string(), "--append INPUT -i lo -j ACCEPT");
    }

    #[test]
    fn test_remove_flips_only_the_verb() {
        let build = |remove| {
            Instruction::append_or_delete(remove, Chain::Output)
                .out_interface("eth0")
                .source("192.168.1.5")
                .destination("192.168.1.0/24")
                .jump(Target::Accept)
        };
        let added = build(false);
        let removed = build(true);
        assert_eq!(added.tokens()[0], "--append");
        assert_eq!(removed.tokens()[0], "--delete");
        assert_eq!(added.tokens()[1..], removed.tokens()[1..]);
    }

    #[test]
    fn test_all_interfaces_omits_match() {
        let instruction = Instruction::append_or_delete(false, Chain::Input)
            .in_interface(ALL_INTERFACES)
            .destination("10.0.0.0/8")
            .jump(Target::Accept);
        assert_eq!(instruction.to_string(), "--append INPUT -d 10.0.0.0/8 -j ACCEPT");
        assert!(!instruction.tokens().iter().any(|t| t == "*"));
    }

    #[test]
    fn test_port_redirection_instructions() {
        let instructions = Instruction::port_redirection("tun0", 51413, 51413, false);
        let rendered: Vec<String> = instructions.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "-t nat --append PREROUTING -i tun0 -p tcp --dport 51413 -j REDIRECT --to-ports 51413",
                "--append INPUT -i tun0 -p tcp -m tcp --dport 51413 -j ACCEPT",
                "-t nat --append PREROUTING -i tun0 -p udp --dport 51413 -j REDIRECT --to-ports 51413",
                "--append INPUT -i tun0 -p udp -m udp --dport 51413 -j ACCEPT",
            ]
        );
    }

    #[test]
    fn test_all_policies() {
        let rendered: Vec<String> = Instruction::all_policies(Policy::Drop)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            rendered,
            vec![
                "--policy INPUT DROP",
                "--policy OUTPUT DROP",
                "--policy FORWARD DROP"
            ]
        );
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("DROP".parse::<Policy>().unwrap(), Policy::Drop);
        assert_eq!("ACCEPT".parse::<Policy>().unwrap(), Policy::Accept);
        assert!("drop".parse::<Policy>().is_err());
        assert!("REJECT".parse::<Policy>().is_err());
    }

    #[test]
    fn test_parse_collapses_whitespace() {
        let instruction = Instruction::parse("  -A OUTPUT   -d 1.1.1.1  -j ACCEPT ");
        assert_eq!(instruction.tokens().len(), 6);
        assert_eq!(instruction.to_string(), "-A OUTPUT -d 1.1.1.1 -j ACCEPT");
    }
}
