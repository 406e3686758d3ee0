//! One-shot shell commands.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::{WorkerError, WorkerResult};

/// Default limit for `execute_command`.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Per-stream cap on returned output.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct ExecuteParams {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ExecuteOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub truncated: bool,
}

/// Run `params.command` through `sh -c` from `home` (or `cwd` below it).
pub async fn execute(home: &Path, params: ExecuteParams) -> WorkerResult<ExecuteOutput> {
    if params.command.trim().is_empty() {
        return Err(WorkerError::InvalidParams("command must not be empty".into()));
    }

    let cwd = resolve_cwd(home, params.cwd.as_deref());
    if !cwd.is_dir() {
        return Err(WorkerError::NotFound(format!(
            "working directory not found: {}",
            cwd.display()
        )));
    }

    let timeout = Duration::from_secs(params.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
    debug!("execute_command in {}: {}", cwd.display(), params.command);

    let child = Command::new("sh")
        .arg("-c")
        .arg(&params.command)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| WorkerError::Command(format!("failed to start shell: {e}")))?;

    // On timeout the child is dropped with the future and killed.
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let (stdout, cut_out) = capture(&output.stdout);
            let (stderr, cut_err) = capture(&output.stderr);
            Ok(ExecuteOutput {
                exit_code: output.status.code(),
                stdout,
                stderr,
                timed_out: false,
                truncated: cut_out || cut_err,
            })
        }
        Ok(Err(e)) => Err(WorkerError::Command(format!("command failed: {e}"))),
        Err(_) => Ok(ExecuteOutput {
            exit_code: None,
            stdout: String::new(),
            stderr: format!("command timed out after {}s", timeout.as_secs()),
            timed_out: true,
            truncated: false,
        }),
    }
}

fn resolve_cwd(home: &Path, cwd: Option<&str>) -> PathBuf {
    match cwd {
        Some(dir) if !dir.is_empty() => home.join(dir),
        _ => home.to_path_buf(),
    }
}

fn capture(bytes: &[u8]) -> (String, bool) {
    if bytes.len() > MAX_CAPTURE_BYTES {
        (
            String::from_utf8_lossy(&bytes[..MAX_CAPTURE_BYTES]).into_owned(),
            true,
        )
    } else {
        (String::from_utf8_lossy(bytes).into_owned(), false)
    }
}
