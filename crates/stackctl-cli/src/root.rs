use stackctl_core::config::CONFIG_FILE;
use stackctl_core::StackError;
use std::path::{Path, PathBuf};

/// Resolve the stack config file.
///
/// Priority:
/// 1. `--config` flag / `STACKCTL_CONFIG` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `stack.yaml`
pub fn resolve_config(explicit: Option<&Path>) -> Result<PathBuf, StackError> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    let cwd = std::env::current_dir()?;
    find_upward(&cwd).ok_or(StackError::ConfigNotFound)
}

fn find_upward(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}
