//! Privilege elevation for firewall engine commands
//!
//! tunwall normally runs as root inside the gateway. When it does not, the
//! iptables family of binaries is run through an elevation helper instead.
//!
//! # Elevation Strategy
//!
//! - **Root**: commands run directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `TUNWALL_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful with sudoers NOPASSWD rules for the iptables binaries.
//! - `TUNWALL_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Only `iptables*` and `ip6tables*` binaries (including their `-save` and
//!   `-restore` companions) can be elevated
//! - Arguments are passed without shell interpolation

use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `TUNWALL_ELEVATION_METHOD`
    #[error("Invalid TUNWALL_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Program is not one of the firewall engine binaries
    #[error("Refusing to elevate '{0}': only iptables binaries may be elevated")]
    ProgramNotAllowed(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Returns true for `iptables`, `ip6tables-nft-save`, `iptables-legacy-restore` and friends.
pub fn is_engine_binary(program: &str) -> bool {
    let name = program.rsplit('/').next().unwrap_or(program);
    let base = name
        .strip_suffix("-save")
        .or_else(|| name.strip_suffix("-restore"))
        .unwrap_or(name);
    matches!(
        base,
        "iptables" | "iptables-nft" | "iptables-legacy" | "ip6tables" | "ip6tables-nft"
            | "ip6tables-legacy"
    )
}

fn wrapped(helper: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(helper);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Creates a command running a firewall engine binary with root privileges.
///
/// # Errors
///
/// Returns `Err` if the program is not an iptables binary, if the forced
/// elevation method is unknown or unavailable, or if no helper exists.
pub fn create_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    if !is_engine_binary(program) {
        return Err(ElevationError::ProgramNotAllowed(program.to_string()));
    }

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("TUNWALL_TEST_NO_ELEVATION").is_ok() {
        return Ok(direct(program, args));
    }

    // 2. Direct Root Execution (No prompt needed)
    if nix::unistd::getuid().is_root() {
        return Ok(direct(program, args));
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("TUNWALL_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if !binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    Ok(wrapped(&method, program, args))
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection - prefer run0 (modern, no SUID), fallback to sudo/pkexec
    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(wrapped("sudo", program, args))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(wrapped("pkexec", program, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[test]
    fn test_binary_exists() {
        // sh should exist on all Unix systems
        assert!(binary_exists("sh"));
        assert!(!binary_exists("tunwall_nonexistent_binary_xyz"));
    }

    #[test]
    fn test_engine_binary_allow_list() {
        assert!(is_engine_binary("iptables"));
        assert!(is_engine_binary("ip6tables-legacy-save"));
        assert!(is_engine_binary("/usr/sbin/iptables-nft-restore"));
        assert!(!is_engine_binary("nft"));
        assert!(!is_engine_binary("sh"));
        assert!(!is_engine_binary("iptables-evil"));
    }

    #[test]
    fn test_refuses_non_engine_program() {
        let result = create_elevated_command("rm", &["-rf", "/"]);
        assert!(matches!(result, Err(ElevationError::ProgramNotAllowed(_))));
    }

    #[tokio::test]
    async fn test_create_command_test_mode() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::set_var("TUNWALL_TEST_NO_ELEVATION", "1");
        }

        let cmd = create_elevated_command("iptables", &["--version"]);
        assert!(cmd.is_ok());
    }

    #[test]
    fn test_invalid_elevation_method() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::remove_var("TUNWALL_TEST_NO_ELEVATION");
            std::env::set_var("TUNWALL_ELEVATION_METHOD", "invalid_method");
        }

        let result = create_elevated_command("iptables", &["--version"]);

        unsafe {
            std::env::set_var("TUNWALL_TEST_NO_ELEVATION", "1");
            std::env::remove_var("TUNWALL_ELEVATION_METHOD");
        }

        // Root skips the method override entirely
        if !nix::unistd::getuid().is_root() {
            assert!(matches!(result, Err(ElevationError::InvalidMethod(_))));
        }
    }
}
