use std::time::Duration;

use crate::config::AssistantSettings;
use crate::process::{self, ProcessError};

#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("failed to launch assistant '{backend}': {source}")]
    Launch {
        backend: String,
        #[source]
        source: std::io::Error,
    },
    #[error("assistant timed out after {0}ms")]
    Timeout(u64),
    #[error("assistant exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },
    #[error("assistant runtime error: {0}")]
    Runtime(String),
}

/// Facade over the hosted assistant CLI. One-shot completions go through
/// `complete`; interactive agent sessions get their command line from
/// `interactive_command` and run inside tmux.
#[derive(Debug, Clone)]
pub struct Assistant {
    pub backend: String,
    pub model: String,
    pub timeout_ms: u64,
}

impl Assistant {
    pub fn from_config(settings: &AssistantSettings) -> Self {
        Self {
            backend: settings.backend.clone(),
            model: settings.model.clone(),
            timeout_ms: settings.timeout_ms,
        }
    }

    /// One-shot arguments per backend. Unknown backends get no flags,
    /// which also lets tests substitute plain filters like `cat`.
    fn oneshot_argv(&self) -> Vec<String> {
        match self.backend.as_str() {
            "claude" => vec![
                "claude".into(),
                "--print".into(),
                "--model".into(),
                self.model.clone(),
            ],
            "codex" => vec![
                "codex".into(),
                "exec".into(),
                "--model".into(),
                self.model.clone(),
            ],
            other => vec![other.to_string()],
        }
    }

    /// The command an interactive worker session runs.
    pub fn interactive_command(&self) -> String {
        match self.backend.as_str() {
            "claude" => format!(
                "claude --model {} --dangerously-skip-permissions",
                self.model
            ),
            "codex" => format!("codex --model {} --full-auto", self.model),
            other => other.to_string(),
        }
    }

    /// Send a prompt on stdin, return the completion from stdout. The call
    /// is bounded by the configured timeout; on expiry the assistant's
    /// whole process group is killed. Non-zero exit is an error carrying
    /// the tool's stderr.
    pub fn complete(&self, prompt: &str) -> Result<String, AssistantError> {
        let argv_owned = self.oneshot_argv();
        let argv: Vec<&str> = argv_owned.iter().map(String::as_str).collect();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| AssistantError::Runtime(e.to_string()))?;
        let result = rt.block_on(process::run_with_timeout(
            &argv,
            None,
            Some(prompt),
            Duration::from_millis(self.timeout_ms),
        ));

        let out = match result {
            Ok(out) => out,
            Err(ProcessError::Timeout { timeout_ms, .. }) => {
                return Err(AssistantError::Timeout(timeout_ms));
            }
            Err(ProcessError::Launch { source, .. }) => {
                return Err(AssistantError::Launch {
                    backend: self.backend.clone(),
                    source,
                });
            }
            Err(ProcessError::EmptyCommand) => {
                return Err(AssistantError::Runtime("empty assistant command".into()));
            }
        };

        if !out.success() {
            return Err(AssistantError::Failed {
                code: out.code,
                stderr: process::stderr_excerpt(&out.stderr),
            });
        }
        Ok(out.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_backend(backend: &str) -> Assistant {
        Assistant {
            backend: backend.into(),
            model: "test".into(),
            timeout_ms: 10_000,
        }
    }

    #[test]
    fn cat_backend_echoes_prompt() {
        let out = with_backend("cat").complete("resolve this file").unwrap();
        assert_eq!(out, "resolve this file");
    }

    #[test]
    fn failing_backend_surfaces_stderr() {
        // sh with no args reads stdin as a script
        let err = with_backend("sh")
            .complete("echo nope >&2; exit 2")
            .unwrap_err();
        match err {
            AssistantError::Failed { code, stderr } => {
                assert_eq!(code, 2);
                assert!(stderr.contains("nope"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn missing_backend_is_launch_error() {
        let err = with_backend("definitely-not-a-real-assistant-xyz")
            .complete("hi")
            .unwrap_err();
        assert!(matches!(err, AssistantError::Launch { .. }));
    }

    #[test]
    fn hung_backend_times_out() {
        let mut assistant = with_backend("sh");
        assistant.timeout_ms = 200;
        let err = assistant.complete("sleep 30").unwrap_err();
        assert!(matches!(err, AssistantError::Timeout(200)));
    }

    #[test]
    fn claude_oneshot_uses_print() {
        let argv = with_backend("claude").oneshot_argv();
        assert_eq!(argv, vec!["claude", "--print", "--model", "test"]);
    }

    #[test]
    fn interactive_command_per_backend() {
        assert!(
            with_backend("claude")
                .interactive_command()
                .contains("--dangerously-skip-permissions")
        );
        assert!(
            with_backend("codex")
                .interactive_command()
                .contains("--full-auto")
        );
        assert_eq!(with_backend("bash").interactive_command(), "bash");
    }
}
