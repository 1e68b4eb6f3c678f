//! tunwall - VPN gateway kill-switch
//!
//! Keeps a Linux VPN client gateway in a default-deny iptables state so that
//! nothing leaks outside the tunnel, while still allowing the VPN server,
//! attached LANs, configured exemptions and user post-rules.
//!
//! # Architecture
//!
//! - [`core`] - Firewall controller, iptables executor and save/restore
//! - [`audit`] - Audit logging of enable/disable events
//! - [`validators`] - Input validation
//! - [`config`] - Gateway configuration file
//! - [`elevation`] - Running iptables with root privileges
//! - [`utils`] - Utility functions (XDG directories)
//!
//! # Safety Features
//!
//! - Full `iptables-save` snapshot before every change, restored on failure
//! - Rollback completes even when the triggering operation is cancelled
//! - SHA-256 snapshot checksums in logs
//! - Only iptables binaries can be elevated

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::firewall::Firewall;
pub use core::iptables::Iptables;
pub use core::memory::MemoryEngine;
pub use core::network::{AddressFamily, DefaultRoute, LocalNetwork, Protocol, VpnEndpoint};
pub use core::runner::{CommandRunner, EngineCommand, SystemRunner};
