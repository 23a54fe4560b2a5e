use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

/// Captured result of an external command. A non-zero exit is not an error
/// at this layer; callers inspect `code` and decide.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Stdout and stderr concatenated, for "does the output mention X" checks.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to launch {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },
    #[error("empty command line")]
    EmptyCommand,
}

/// First 500 chars of a tool's stderr, trimmed, for user-visible errors.
pub fn stderr_excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    match trimmed.char_indices().nth(500) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}

/// Run a command to completion, capturing both streams. No timeout is
/// imposed here; callers that need one compose `run_with_timeout`.
pub fn run(argv: &[&str], cwd: Option<&Path>) -> Result<CmdOutput, ProcessError> {
    let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let output = cmd.output().map_err(|source| ProcessError::Launch {
        command: (*program).to_string(),
        source,
    })?;
    Ok(CmdOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        code: output.status.code().unwrap_or(-1),
    })
}

/// Run with an outer timeout, optionally feeding `stdin` to the child.
/// The child gets its own process group so a timeout can kill the whole
/// tree, not just the direct child.
pub async fn run_with_timeout(
    argv: &[&str],
    cwd: Option<&Path>,
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<CmdOutput, ProcessError> {
    use tokio::io::AsyncWriteExt;

    let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let mut child = cmd.spawn().map_err(|source| ProcessError::Launch {
        command: (*program).to_string(),
        source,
    })?;
    let pid = child.id();

    if let (Some(data), Some(mut handle)) = (stdin, child.stdin.take()) {
        let data = data.as_bytes().to_vec();
        // Dropping the handle closes the pipe so filters see EOF.
        tokio::spawn(async move {
            let _ = handle.write_all(&data).await;
        });
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => {
            let output = result.map_err(|source| ProcessError::Launch {
                command: (*program).to_string(),
                source,
            })?;
            Ok(CmdOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                code: output.status.code().unwrap_or(-1),
            })
        }
        Err(_) => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            Err(ProcessError::Timeout {
                command: (*program).to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

fn kill_process_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;
    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}
