//! Gateway firewall controller
//!
//! [`Firewall`] holds the desired policy (VPN endpoint, allowed ports,
//! redirections, outbound subnets) and switches the kill-switch on and off.
//! Enabling snapshots the current rules, installs the drop-by-default policy
//! and keeps the snapshot so that disabling restores the rules exactly.
//!
//! The state lock is held for the whole of every operation, so enable,
//! disable and live updates never interleave.

mod policy;
mod updates;

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::core::error::{Result, ResultExt};
use crate::core::iptables::{Iptables, Restore, Revert};
use crate::core::network::{DefaultRoute, LocalNetwork, PortRedirection, VpnEndpoint};
use crate::core::routing::RoutingProvider;
use crate::core::runner::CommandRunner;
use ipnetwork::IpNetwork;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Where user post-rules are read from unless configured otherwise.
pub const DEFAULT_POST_RULES_PATH: &str = "/iptables/post-rules.txt";

/// Everything the controller remembers between operations
#[derive(Debug, Default)]
pub struct FirewallState {
    pub enabled: bool,
    restore: Option<Restore>,
    pub vpn_connection: Option<VpnEndpoint>,
    pub vpn_interface: Option<String>,
    pub default_routes: Vec<DefaultRoute>,
    pub local_networks: Vec<LocalNetwork>,
    pub outbound_subnets: Vec<IpNetwork>,
    /// Port to the set of interfaces it is open on
    pub allowed_input_ports: BTreeMap<u16, BTreeSet<String>>,
    pub port_redirections: Vec<PortRedirection>,
}

impl FirewallState {
    /// True while a pre-enable snapshot is held.
    pub fn has_restore(&self) -> bool {
        self.restore.is_some()
    }
}

/// Kill-switch controller over an [`Iptables`] executor
pub struct Firewall {
    iptables: Iptables,
    routing: Arc<dyn RoutingProvider>,
    post_rules_path: PathBuf,
    audit: Option<AuditLog>,
    state: Mutex<FirewallState>,
}

impl std::fmt::Debug for Firewall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firewall")
            .field("iptables", &self.iptables)
            .field("post_rules_path", &self.post_rules_path)
            .finish_non_exhaustive()
    }
}

impl Firewall {
    /// Detects the iptables engines and builds a disabled controller.
    ///
    /// # Errors
    ///
    /// Fails if no IPv4 engine is usable.
    pub async fn new(
        runner: Arc<dyn CommandRunner>,
        routing: Arc<dyn RoutingProvider>,
        post_rules_path: impl Into<PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let iptables = Iptables::new(runner, cancel)
            .await
            .context("creating iptables firewall")?;
        Ok(Self {
            iptables,
            routing,
            post_rules_path: post_rules_path.into(),
            audit: None,
            state: Mutex::new(FirewallState::default()),
        })
    }

    /// Records enable/disable events in the given audit log.
    #[must_use]
    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn iptables(&self) -> &Iptables {
        &self.iptables
    }

    pub fn post_rules_path(&self) -> &Path {
        &self.post_rules_path
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    /// Runs `f` against the current state under the state lock.
    pub async fn inspect<T>(&self, f: impl FnOnce(&FirewallState) -> T) -> T {
        f(&*self.state.lock().await)
    }

    pub async fn version(&self, cancel: &CancellationToken) -> Result<String> {
        self.iptables.version(cancel).await
    }

    /// Turns the kill-switch on or off.
    ///
    /// Asking for the current state is a no-op. A failed enable leaves the
    /// rules as they were before the call and the controller disabled.
    /// Disabling always succeeds; restore problems are only logged.
    pub async fn set_enabled(&self, enabled: bool, cancel: &CancellationToken) -> Result<()> {
        let mut state = self.state.lock().await;

        if enabled == state.enabled {
            if enabled {
                info!("already enabled");
            } else {
                info!("already disabled");
            }
            return Ok(());
        }

        if !enabled {
            info!("disabling...");
            if let Some(restore) = state.restore.take() {
                restore.revert().await;
            }
            state.enabled = false;
            info!("disabled successfully");
            self.audit(EventType::DisableFirewall, &state, None).await;
            return Ok(());
        }

        info!("enabling...");
        if let Err(err) = self.enable(&mut state, cancel).await {
            let err = err.context("enabling firewall");
            self.audit(EventType::EnableFirewall, &state, Some(err.to_string()))
                .await;
            return Err(err);
        }
        state.enabled = true;
        info!("enabled successfully");
        self.audit(EventType::EnableFirewall, &state, None).await;
        Ok(())
    }

    async fn audit(&self, event_type: EventType, state: &FirewallState, error: Option<String>) {
        let Some(audit) = &self.audit else {
            return;
        };
        let details = serde_json::json!({
            "vpn_connection": state.vpn_connection.map(|c| c.to_string()),
            "vpn_interface": state.vpn_interface,
            "allowed_input_ports": state.allowed_input_ports.keys().collect::<Vec<_>>(),
            "port_redirections": state.port_redirections.len(),
            "outbound_subnets": state.outbound_subnets,
        });
        audit
            .record(AuditEvent::new(event_type, error.is_none(), details, error))
            .await;
    }
}
