use super::instruction::{Chain, Instruction, Target};
use crate::core::error::{Error, Result};
use crate::core::runner::{CommandRunner, EngineCommand};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Interface name no real host will have, used for the probe rule.
const PROBE_INTERFACE: &str = "testinterface1234";

pub(super) enum Support {
    Supported(String),
    /// Collected failure messages of every candidate
    Unsupported(String),
}

/// Returns the first candidate that can add and delete a rule.
pub(super) async fn find_supported(
    runner: &dyn CommandRunner,
    candidates: &[&str],
    cancel: &CancellationToken,
) -> Result<Support> {
    let mut failures = Vec::with_capacity(candidates.len());
    for binary in candidates {
        match probe(runner, binary, cancel).await {
            Ok(()) => return Ok(Support::Supported((*binary).to_string())),
            Err(err @ (Error::Cancelled(_) | Error::NetAdminMissing { .. })) => return Err(err),
            Err(err) => {
                debug!("{binary} is not usable: {err}");
                failures.push(format!("{binary}: {err}"));
            }
        }
    }
    Ok(Support::Unsupported(failures.join("; ")))
}

fn probe_rule(remove: bool) -> Instruction {
    Instruction::append_or_delete(remove, Chain::Output)
        .out_interface(PROBE_INTERFACE)
        .jump(Target::Drop)
}

async fn probe(runner: &dyn CommandRunner, binary: &str, cancel: &CancellationToken) -> Result<()> {
    for remove in [false, true] {
        let command = EngineCommand::new(binary).args(probe_rule(remove).tokens());
        runner
            .run(&command, cancel)
            .await
            .map_err(|err| classify(binary, err))?;
    }
    Ok(())
}

fn classify(binary: &str, err: Error) -> Error {
    if let Error::CommandFailed { output, .. } = &err {
        let lower = output.to_lowercase();
        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return Error::NetAdminMissing {
                binary: binary.to_string(),
            };
        }
    }
    err
}
