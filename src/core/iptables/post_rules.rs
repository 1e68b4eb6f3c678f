//! User post-rules file
//!
//! Each line is a full command such as `iptables -A OUTPUT -d 1.1.1.1 -j ACCEPT`.
//! The leading binary name selects the address family and is replaced by the
//! detected engine. Lines matching no prefix (comments, blanks, other tools)
//! are skipped.

use super::instruction::Instruction;
use super::{Iptables, Revert};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::network::AddressFamily;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Recognised line prefixes. The first match wins, so order matters.
pub const POST_RULE_PREFIXES: [(&str, AddressFamily); 6] = [
    ("iptables ", AddressFamily::V4),
    ("iptables-nft ", AddressFamily::V4),
    ("iptables-legacy ", AddressFamily::V4),
    ("ip6tables ", AddressFamily::V6),
    ("ip6tables-nft ", AddressFamily::V6),
    ("ip6tables-legacy ", AddressFamily::V6),
];

/// Parses one post-rules line into its family and engine arguments.
pub fn parse_post_rule(line: &str) -> Option<(AddressFamily, Instruction)> {
    let line = line.trim();
    POST_RULE_PREFIXES.iter().find_map(|(prefix, family)| {
        line.strip_prefix(prefix)
            .map(|rest| (*family, Instruction::parse(rest)))
    })
}

impl Iptables {
    /// Runs every recognised line of the post-rules file.
    ///
    /// A missing file is not an error. If any line fails, all post-rules
    /// already applied are reverted.
    pub async fn run_user_post_rules(&self, path: &Path, cancel: &CancellationToken) -> Result<()> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no post-rules file at {}", path.display());
                return Ok(());
            }
            Err(err) => {
                return Err(Error::Io(err)).with_context(|| {
                    format!("reading post-rules file {}", path.display())
                });
            }
        };

        let rules: Vec<(AddressFamily, Instruction)> = content
            .lines()
            .filter_map(parse_post_rule)
            .filter(|(_, instruction)| !instruction.is_empty())
            .collect();
        if rules.is_empty() {
            return Ok(());
        }

        let (ipv4, ipv6) = self.lock_both().await;
        let restore = self.save_locked(&ipv4, ipv6.as_ref(), cancel).await?;
        for (family, instruction) in &rules {
            let result = match family {
                AddressFamily::V4 => ipv4.run(self.runner.as_ref(), instruction, cancel).await,
                AddressFamily::V6 => match ipv6.as_ref() {
                    Some(ipv6) => ipv6.run(self.runner.as_ref(), instruction, cancel).await,
                    None => Err(Error::NeedIp6tables(format!("post-rule \"{instruction}\""))),
                },
            };
            if let Err(err) = result {
                restore.revert().await;
                return Err(err);
            }
        }
        info!(
            "applied {} post-rules from {}",
            rules.len(),
            path.display()
        );
        Ok(())
    }
}
