//! Save/restore transactions around rule mutations
//!
//! Before mutating, callers capture the full rule set of each family with
//! `iptables-save` and keep a [`Restore`] handle. Reverting feeds the dumps
//! back to `iptables-restore`.
//!
//! Snapshots must be taken while holding the family locks. The handle itself
//! never touches those locks, so it can be reverted from inside the locked
//! region that created it.

use super::{Engine, Iptables};
use crate::core::error::{Result, ResultExt};
use crate::core::network::AddressFamily;
use crate::core::runner::{CommandRunner, EngineCommand};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Something that can put the firewall back the way it was.
#[async_trait]
pub trait Revert: Send + Sync {
    /// Best effort: failures are logged, never returned.
    async fn revert(&self);
}

/// `iptables-save` output of one address family
#[derive(Clone, PartialEq, Eq)]
pub struct RuleSnapshot {
    family: AddressFamily,
    restore_binary: String,
    data: String,
}

impl RuleSnapshot {
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    /// SHA-256 of the dump, used to identify snapshots in logs.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.data.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    async fn apply(&self, runner: &dyn CommandRunner, cancel: &CancellationToken) -> Result<()> {
        let command = EngineCommand::new(&self.restore_binary).stdin(self.data.clone());
        runner.run(&command, cancel).await.map(drop)
    }
}

impl fmt::Debug for RuleSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleSnapshot")
            .field("family", &self.family)
            .field("restore_binary", &self.restore_binary)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Ordered set of snapshots reverted together, IPv4 first
pub struct Restore {
    runner: Arc<dyn CommandRunner>,
    snapshots: Vec<RuleSnapshot>,
}

impl Restore {
    pub(crate) fn new(runner: Arc<dyn CommandRunner>, snapshots: Vec<RuleSnapshot>) -> Self {
        Self { runner, snapshots }
    }

    pub fn snapshots(&self) -> &[RuleSnapshot] {
        &self.snapshots
    }

    pub fn snapshot(&self, family: AddressFamily) -> Option<&RuleSnapshot> {
        self.snapshots.iter().find(|s| s.family == family)
    }

    /// Keeps only the snapshot of one family.
    pub fn only(&self, family: AddressFamily) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            snapshots: self
                .snapshots
                .iter()
                .filter(|s| s.family == family)
                .cloned()
                .collect(),
        }
    }
}

impl fmt::Debug for Restore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Restore")
            .field("snapshots", &self.snapshots)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Revert for Restore {
    async fn revert(&self) {
        // Rollback must finish even when the caller's operation was cancelled
        let cancel = CancellationToken::new();
        for snapshot in &self.snapshots {
            match snapshot.apply(self.runner.as_ref(), &cancel).await {
                Ok(()) => debug!(
                    "restored {} rules from snapshot {}",
                    snapshot.family,
                    &snapshot.checksum()[..12]
                ),
                Err(err) => warn!("restoring {} rules failed: {err}", snapshot.family),
            }
        }
    }
}

impl Engine {
    /// Caller must hold this engine's lock.
    pub(super) async fn save(
        &self,
        runner: &dyn CommandRunner,
        cancel: &CancellationToken,
    ) -> Result<RuleSnapshot> {
        let command = EngineCommand::new(format!("{}-save", self.binary));
        let data = runner
            .run(&command, cancel)
            .await
            .with_context(|| format!("saving {} rules", self.family))?;
        Ok(RuleSnapshot {
            family: self.family,
            restore_binary: format!("{}-restore", self.binary),
            data,
        })
    }
}

impl Iptables {
    /// Captures IPv4 rules, and IPv6 rules when an IPv6 engine exists.
    pub async fn save_and_restore(&self, cancel: &CancellationToken) -> Result<Restore> {
        let (ipv4, ipv6) = self.lock_both().await;
        self.save_locked(&ipv4, ipv6.as_ref(), cancel).await
    }

    /// Caller must hold both family locks.
    pub(super) async fn save_locked(
        &self,
        ipv4: &Engine,
        ipv6: Option<&Engine>,
        cancel: &CancellationToken,
    ) -> Result<Restore> {
        let mut snapshots = vec![ipv4.save(self.runner.as_ref(), cancel).await?];
        if let Some(ipv6) = ipv6 {
            snapshots.push(ipv6.save(self.runner.as_ref(), cancel).await?);
        }
        Ok(Restore::new(Arc::clone(&self.runner), snapshots))
    }

    pub(super) fn restore_from(&self, snapshots: Vec<RuleSnapshot>) -> Restore {
        Restore::new(Arc::clone(&self.runner), snapshots)
    }
}
