//! Subprocess invocation for the external CLIs stackctl drives.
//!
//! Every collaborator (kubectl, helm, kind, lsof) is invoked the same way:
//! arguments in, stdout captured, stderr captured for error reporting. A
//! non-zero exit becomes [`StackError::CommandFailed`] unless the caller asks
//! for the raw [`Output`] to interpret the failure itself.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Output, Stdio};

use tokio::process::Command;

use crate::error::{Result, StackError};

/// Run `program args...` and return its raw output regardless of exit status.
pub async fn output<I, S>(program: &Path, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(program = %program.display(), "exec");
    Ok(cmd.output().await?)
}

/// Run `program args...` and return stdout, failing on a non-zero exit.
pub async fn run<I, S>(program: &Path, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let out = output(program, args).await?;
    if !out.status.success() {
        return Err(failure(program, &out));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Build a [`StackError::CommandFailed`] from a finished process.
pub fn failure(program: &Path, out: &Output) -> StackError {
    let stderr = String::from_utf8_lossy(&out.stderr);
    StackError::CommandFailed {
        program: program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string()),
        status: out
            .status
            .code()
            .map(|c| format!("exit {c}"))
            .unwrap_or_else(|| "killed".to_string()),
        stderr: stderr.trim().chars().take(500).collect(),
    }
}

/// Non-empty, trimmed lines of a command's stdout.
pub fn lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
