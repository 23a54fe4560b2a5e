use std::path::Path;

use crate::process::{self, ProcessError, stderr_excerpt};

pub const SESSION_PREFIX: &str = "overstory-";

/// tmux session name for an agent.
pub fn session_name(agent_name: &str) -> String {
    format!("{SESSION_PREFIX}{agent_name}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: String,
    pub pid: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} already exists")]
    AlreadyExists(String),
    #[error("session {0} not found after create")]
    PidNotFound(String),
    #[error("tmux {op} failed: {stderr}")]
    Tmux { op: &'static str, stderr: String },
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Start a detached session running `command` in `cwd`, and return the
/// session leader's pid recovered from the session listing.
pub fn create(name: &str, cwd: &Path, command: &str) -> Result<u32, SessionError> {
    if is_alive(name) {
        return Err(SessionError::AlreadyExists(name.to_string()));
    }
    let cwd_str = cwd.to_string_lossy().into_owned();
    let out = process::run(
        &["tmux", "new-session", "-d", "-s", name, "-c", &cwd_str, command],
        None,
    )?;
    if !out.success() {
        return Err(SessionError::Tmux {
            op: "new-session",
            stderr: stderr_excerpt(&out.stderr),
        });
    }
    list()?
        .into_iter()
        .find(|s| s.name == name)
        .map(|s| s.pid)
        .ok_or_else(|| SessionError::PidNotFound(name.to_string()))
}

/// List sessions as (name, pid). A host with no tmux server (or no
/// sessions) is empty, not an error.
pub fn list() -> Result<Vec<SessionInfo>, SessionError> {
    let out = process::run(
        &["tmux", "list-sessions", "-F", "#{session_name}:#{pid}"],
        None,
    )?;
    if !out.success() {
        let stderr = out.stderr.to_lowercase();
        if stderr.contains("no server running") || stderr.contains("no sessions") {
            return Ok(Vec::new());
        }
        return Err(SessionError::Tmux {
            op: "list-sessions",
            stderr: stderr_excerpt(&out.stderr),
        });
    }
    Ok(parse_sessions(&out.stdout))
}

fn parse_sessions(output: &str) -> Vec<SessionInfo> {
    output
        .lines()
        .filter_map(|line| {
            let (name, pid) = line.rsplit_once(':')?;
            Some(SessionInfo {
                name: name.to_string(),
                pid: pid.trim().parse().ok()?,
            })
        })
        .collect()
}

pub fn kill(name: &str) -> Result<(), SessionError> {
    let out = process::run(&["tmux", "kill-session", "-t", name], None)?;
    if !out.success() {
        return Err(SessionError::Tmux {
            op: "kill-session",
            stderr: stderr_excerpt(&out.stderr),
        });
    }
    Ok(())
}

pub fn is_alive(name: &str) -> bool {
    process::run(&["tmux", "has-session", "-t", name], None)
        .map(|out| out.success())
        .unwrap_or(false)
}

/// Deliver text to a live session, followed by Enter.
pub fn send_keys(name: &str, text: &str) -> Result<(), SessionError> {
    let out = process::run(&["tmux", "send-keys", "-t", name, text, "Enter"], None)?;
    if !out.success() {
        return Err(SessionError::Tmux {
            op: "send-keys",
            stderr: stderr_excerpt(&out.stderr),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_name_prefixed() {
        assert_eq!(session_name("impl"), "overstory-impl");
    }

    #[test]
    fn parse_sessions_splits_name_and_pid() {
        let parsed = parse_sessions("overstory-impl:4242\noverstory-scout-1:99\n");
        assert_eq!(
            parsed,
            vec![
                SessionInfo {
                    name: "overstory-impl".into(),
                    pid: 4242
                },
                SessionInfo {
                    name: "overstory-scout-1".into(),
                    pid: 99
                },
            ]
        );
    }

    #[test]
    fn parse_sessions_skips_malformed_lines() {
        let parsed = parse_sessions("no-colon-here\noverstory-impl:notapid\nok:7\n");
        assert_eq!(
            parsed,
            vec![SessionInfo {
                name: "ok".into(),
                pid: 7
            }]
        );
    }

    #[test]
    fn parse_sessions_empty_output() {
        assert!(parse_sessions("").is_empty());
    }

    #[test]
    fn dead_session_is_not_alive() {
        // Name that no test environment will have
        assert!(!is_alive("overstory-test-definitely-absent-xyz"));
    }
}
