//! Command execution collaborator
//!
//! Every iptables, `*-save` and `*-restore` invocation goes through a
//! [`CommandRunner`]. Production code uses [`SystemRunner`], which spawns the
//! binary (elevated when needed). Tests and `tunwall dry-run` use
//! [`MemoryEngine`](crate::core::memory::MemoryEngine).

use crate::core::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A program invocation with optional standard input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Runs external commands on behalf of the firewall.
///
/// Implementations return the command's standard output on success and
/// [`Error::CommandFailed`] (with the combined output) on a non-zero exit.
/// A cancelled token must abort the command and yield [`Error::Cancelled`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &EngineCommand, cancel: &CancellationToken) -> Result<String>;
}

/// Runs commands as real processes via `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &EngineCommand, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(command.to_string()));
        }

        let args: Vec<&str> = command.args.iter().map(String::as_str).collect();
        let mut process = crate::elevation::create_elevated_command(&command.program, &args)?;
        process
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = process
            .spawn()
            .map_err(|e| Error::Io(e).context(format!("spawning {}", command.program)))?;

        let stdin = child.stdin.take();
        let exchange = async move {
            // A write error (EPIPE when *-restore exits early) must not hide
            // what the engine printed, so the output is collected regardless.
            let written = match (&command.stdin, stdin) {
                (Some(input), Some(mut stdin)) => stdin.write_all(input.as_bytes()).await,
                _ => Ok(()),
            };
            // stdin is dropped above, closing the pipe so *-restore sees EOF
            child.wait_with_output().await.map(|output| (written, output))
        };

        // Dropping the exchange on cancellation drops the child, which kills it
        let (written, output) = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled(command.to_string())),
            result = exchange => result?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() && written.is_ok() {
            if !stderr.trim().is_empty() {
                debug!("{}: {}", command.program, stderr.trim());
            }
            Ok(stdout)
        } else {
            let write_error = written.err().map(|e| format!("writing input: {e}"));
            let combined = [stdout.trim(), stderr.trim()]
                .into_iter()
                .chain(write_error.as_deref())
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            Err(Error::CommandFailed {
                command: command.to_string(),
                output: combined,
                exit_code: output.status.code(),
            })
        }
    }
}
