//! iptables/ip6tables rule executor
//!
//! [`Iptables`] owns one engine per address family, each behind its own
//! async mutex. Operations touching both families always lock IPv4 before
//! IPv6. Every mutating operation snapshots the families it touches and
//! reverts them if any instruction fails, so a rule group is applied
//! all-or-nothing.
//!
//! - [`instruction`]: typed builder for the argument lists
//! - [`atomic`]: save/restore snapshots and the [`Revert`] handle
//! - [`rules`]: the firewall operations used by the policy builder
//! - [`post_rules`]: user post-rules file dispatch

pub mod atomic;
pub mod instruction;
pub mod post_rules;
mod rules;
mod support;

pub use atomic::{Restore, Revert, RuleSnapshot};
pub use instruction::{Chain, Instruction, Policy, Target};
pub use post_rules::{POST_RULE_PREFIXES, parse_post_rule};

use crate::core::error::{Error, Result};
use crate::core::network::AddressFamily;
use crate::core::runner::{CommandRunner, EngineCommand};
use std::sync::Arc;
use support::Support;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Binary names tried for IPv4, in order of preference
pub const IPV4_CANDIDATES: [&str; 3] = ["iptables", "iptables-nft", "iptables-legacy"];

/// Binary names tried for IPv6, in order of preference
pub const IPV6_CANDIDATES: [&str; 3] = ["ip6tables", "ip6tables-nft", "ip6tables-legacy"];

/// One detected engine binary. Only reachable through its family lock.
#[derive(Debug)]
pub(crate) struct Engine {
    family: AddressFamily,
    binary: String,
}

impl Engine {
    async fn run(
        &self,
        runner: &dyn CommandRunner,
        instruction: &Instruction,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let command = EngineCommand::new(&self.binary).args(instruction.tokens());
        debug!("{command}");
        runner.run(&command, cancel).await.map(drop)
    }

    async fn run_all(
        &self,
        runner: &dyn CommandRunner,
        instructions: &[Instruction],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for instruction in instructions {
            self.run(runner, instruction, cancel).await?;
        }
        Ok(())
    }
}

/// Rule executor over the detected iptables and ip6tables binaries
pub struct Iptables {
    runner: Arc<dyn CommandRunner>,
    ipv4: Mutex<Engine>,
    ipv6: Mutex<Option<Engine>>,
    ipv4_binary: String,
    ipv6_binary: Option<String>,
}

impl std::fmt::Debug for Iptables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iptables")
            .field("ipv4", &self.ipv4_binary)
            .field("ipv6", &self.ipv6_binary)
            .finish_non_exhaustive()
    }
}

impl Iptables {
    /// Detects working engine binaries.
    ///
    /// # Errors
    ///
    /// Fails when no IPv4 binary works, or when the process lacks the
    /// privileges to modify rules. A missing IPv6 binary only disables IPv6.
    pub async fn new(runner: Arc<dyn CommandRunner>, cancel: &CancellationToken) -> Result<Self> {
        let ipv4 =
            match support::find_supported(runner.as_ref(), &IPV4_CANDIDATES, cancel).await? {
                Support::Supported(binary) => binary,
                Support::Unsupported(details) => {
                    return Err(Error::EngineUnavailable {
                        family: AddressFamily::V4,
                        details,
                    });
                }
            };

        let ipv6 =
            match support::find_supported(runner.as_ref(), &IPV6_CANDIDATES, cancel).await? {
                Support::Supported(binary) => Some(binary),
                Support::Unsupported(details) => {
                    info!("ip6tables not supported: {details}");
                    None
                }
            };

        info!(
            "using {ipv4} and {}",
            ipv6.as_deref().unwrap_or("no IPv6 firewall")
        );

        Ok(Self {
            runner,
            ipv4: Mutex::new(Engine {
                family: AddressFamily::V4,
                binary: ipv4.clone(),
            }),
            ipv6: Mutex::new(ipv6.clone().map(|binary| Engine {
                family: AddressFamily::V6,
                binary,
            })),
            ipv4_binary: ipv4,
            ipv6_binary: ipv6,
        })
    }

    pub fn ipv4_binary(&self) -> &str {
        &self.ipv4_binary
    }

    pub fn ipv6_binary(&self) -> Option<&str> {
        self.ipv6_binary.as_deref()
    }

    pub fn ipv6_supported(&self) -> bool {
        self.ipv6_binary.is_some()
    }

    /// Version of the IPv4 engine, e.g. `iptables v1.8.10`.
    pub async fn version(&self, cancel: &CancellationToken) -> Result<String> {
        let command = EngineCommand::new(&self.ipv4_binary).arg("--version");
        let output = self.runner.run(&command, cancel).await?;
        let words: Vec<&str> = output.split_whitespace().collect();
        if words.len() < 2 {
            return Err(Error::VersionTooShort(output.trim().to_string()));
        }
        Ok(format!("iptables {}", words[1]))
    }

    /// Locks IPv4 then IPv6. Every two-family operation goes through here.
    async fn lock_both(&self) -> (MutexGuard<'_, Engine>, MutexGuard<'_, Option<Engine>>) {
        let ipv4 = self.ipv4.lock().await;
        let ipv6 = self.ipv6.lock().await;
        (ipv4, ipv6)
    }

    async fn run_ipv4_instructions(
        &self,
        instructions: &[Instruction],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ipv4 = self.ipv4.lock().await;
        let snapshot = ipv4.save(self.runner.as_ref(), cancel).await?;
        if let Err(err) = ipv4.run_all(self.runner.as_ref(), instructions, cancel).await {
            self.restore_from(vec![snapshot]).revert().await;
            return Err(err);
        }
        Ok(())
    }

    /// Runs IPv6 instructions; a no-op when there is no IPv6 engine.
    async fn run_ipv6_instructions(
        &self,
        instructions: &[Instruction],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ipv6 = self.ipv6.lock().await;
        let Some(ipv6) = ipv6.as_ref() else {
            return Ok(());
        };
        let snapshot = ipv6.save(self.runner.as_ref(), cancel).await?;
        if let Err(err) = ipv6.run_all(self.runner.as_ref(), instructions, cancel).await {
            self.restore_from(vec![snapshot]).revert().await;
            return Err(err);
        }
        Ok(())
    }

    /// Runs instructions on one family; IPv6 without an engine is an error
    /// described by `needed_for`.
    async fn run_family_instructions(
        &self,
        family: AddressFamily,
        instructions: &[Instruction],
        needed_for: impl FnOnce() -> String,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match family {
            AddressFamily::V4 => self.run_ipv4_instructions(instructions, cancel).await,
            AddressFamily::V6 if self.ipv6_supported() => {
                self.run_ipv6_instructions(instructions, cancel).await
            }
            AddressFamily::V6 => Err(Error::NeedIp6tables(needed_for())),
        }
    }

    /// Applies each instruction to IPv4 then IPv6, reverting both families
    /// if any step fails.
    async fn run_mixed_instructions(
        &self,
        instructions: &[Instruction],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (ipv4, ipv6) = self.lock_both().await;
        let restore = self.save_locked(&ipv4, ipv6.as_ref(), cancel).await?;
        for instruction in instructions {
            let mut result = ipv4.run(self.runner.as_ref(), instruction, cancel).await;
            if result.is_ok()
                && let Some(ipv6) = ipv6.as_ref()
            {
                result = ipv6.run(self.runner.as_ref(), instruction, cancel).await;
            }
            if let Err(err) = result {
                restore.revert().await;
                return Err(err);
            }
        }
        Ok(())
    }
}
