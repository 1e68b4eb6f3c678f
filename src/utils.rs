//! Utility functions for directory management
//!
//! Follows the XDG Base Directory specification.
//!
//! # Directory Structure
//!
//! - Config: `~/.config/tunwall/` - Gateway configuration (`config.json`)
//! - State: `~/.local/state/tunwall/` - Runtime state (audit log)
//!
//! # Example
//!
//! ```no_run
//! use tunwall::utils::{ensure_dirs, get_config_dir};
//!
//! ensure_dirs().expect("Failed to create directories");
//!
//! if let Some(config_dir) = get_config_dir() {
//!     let _config = config_dir.join("config.json");
//! }
//! ```

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "tunwall", "tunwall")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;

    let mut builder = DirBuilder::new();
    builder.mode(0o700); // User read/write/execute only
    builder.recursive(true);

    if let Some(dir) = get_config_dir() {
        builder.create(dir)?;
    }
    if let Some(dir) = get_state_dir() {
        builder.create(dir)?;
    }

    Ok(())
}
