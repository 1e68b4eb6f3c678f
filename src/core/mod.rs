//! Core firewall control plane
//!
//! This module drives iptables and ip6tables to keep a VPN gateway in a
//! default-deny state. It provides:
//!
//! - [`firewall`]: The enable/disable controller and live policy updates
//! - [`iptables`]: Engine detection, rule operations and save/restore
//! - [`network`]: Topology types (routes, local networks, VPN endpoint)
//! - [`routing`]: Routing collaborator consulted on every enable
//! - [`runner`]: Command execution, real or emulated
//! - [`memory`]: In-memory iptables used by `dry-run` and tests
//! - [`error`]: Error types for firewall operations

pub mod error;
pub mod firewall;
pub mod iptables;
pub mod memory;
pub mod network;
pub mod routing;
pub mod runner;

#[cfg(test)]
pub mod test_helpers;
