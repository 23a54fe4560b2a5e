use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::assistant::Assistant;
use crate::config::MergeSettings;
use crate::process::{self, CmdOutput, ProcessError, stderr_excerpt};

/// Which rung of the escalation ladder resolved the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeTier {
    CleanMerge,
    AutoResolve,
    AiResolve,
    Reimagine,
}

impl MergeTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CleanMerge => "clean-merge",
            Self::AutoResolve => "auto-resolve",
            Self::AiResolve => "ai-resolve",
            Self::Reimagine => "reimagine",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStatus {
    Pending,
    Merged,
    Failed,
}

/// One branch waiting to land on the canonical branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeEntry {
    pub branch_name: String,
    pub task_id: String,
    pub agent_name: String,
    pub files_modified: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
    pub status: MergeStatus,
    pub resolved_tier: Option<MergeTier>,
}

impl MergeEntry {
    pub fn new(
        branch_name: impl Into<String>,
        task_id: impl Into<String>,
        agent_name: impl Into<String>,
        files_modified: Vec<String>,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            branch_name: branch_name.into(),
            task_id: task_id.into(),
            agent_name: agent_name.into(),
            files_modified,
            enqueued_at,
            status: MergeStatus::Pending,
            resolved_tier: None,
        }
    }
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub entry: MergeEntry,
    pub success: bool,
    pub tier: Option<MergeTier>,
    pub conflict_files: Vec<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("git {op} failed: {stderr}")]
    Git { op: String, stderr: String },
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("assistant resolution failed: {0}")]
    Assistant(String),
    #[error(
        "{count} conflicted file(s) in {branch} could not be auto-resolved \
         and escalation tiers are disabled"
    )]
    Unresolved { branch: String, count: usize },
}

/// Merges mutate the canonical branch, so only one resolve runs at a time
/// per process regardless of how many entries are queued.
static CANONICAL_MERGE: Mutex<()> = Mutex::new(());

/// Strip standard conflict markers, keeping the incoming (branch) side.
/// Returns None when the content carries no markers, the delete/modify
/// class that tier 2 cannot touch.
pub(crate) fn strip_conflict_markers(content: &str) -> Option<String> {
    if !content.contains("<<<<<<<") {
        return None;
    }

    enum State {
        Keep,
        Ours,
        Theirs,
    }
    let mut state = State::Keep;
    let mut kept: Vec<&str> = Vec::new();
    let mut saw_marker = false;

    for line in content.lines() {
        match state {
            State::Keep => {
                if line.starts_with("<<<<<<<") {
                    state = State::Ours;
                    saw_marker = true;
                } else {
                    kept.push(line);
                }
            }
            // HEAD side, and the diff3 base section if present, both drop.
            State::Ours => {
                if line == "=======" {
                    state = State::Theirs;
                }
            }
            State::Theirs => {
                if line.starts_with(">>>>>>>") {
                    state = State::Keep;
                } else {
                    kept.push(line);
                }
            }
        }
    }

    if !saw_marker {
        return None;
    }
    let mut out = kept.join("\n");
    if content.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    Some(out)
}

pub struct Resolver<'a> {
    repo_root: &'a Path,
    canonical: &'a str,
    settings: &'a MergeSettings,
    assistant: &'a Assistant,
}

impl<'a> Resolver<'a> {
    pub fn new(
        repo_root: &'a Path,
        canonical: &'a str,
        settings: &'a MergeSettings,
        assistant: &'a Assistant,
    ) -> Self {
        Self {
            repo_root,
            canonical,
            settings,
            assistant,
        }
    }

    fn git(&self, args: &[&str]) -> Result<CmdOutput, MergeError> {
        let mut argv = vec!["git"];
        argv.extend_from_slice(args);
        Ok(process::run(&argv, Some(self.repo_root))?)
    }

    fn git_ok(&self, op: &str, args: &[&str]) -> Result<CmdOutput, MergeError> {
        let out = self.git(args)?;
        if !out.success() {
            return Err(MergeError::Git {
                op: op.to_string(),
                stderr: stderr_excerpt(&out.combined()),
            });
        }
        Ok(out)
    }

    /// Walk a branch through the four tiers. Whatever happens, the working
    /// copy is clean when this returns.
    pub fn resolve(&self, mut entry: MergeEntry) -> MergeOutcome {
        let _lock = CANONICAL_MERGE.lock().unwrap_or_else(|e| e.into_inner());

        let mut conflicts = Vec::new();
        let result = self.run_tiers(&entry, &mut conflicts);
        self.restore_clean_state();

        match result {
            Ok(tier) => {
                tracing::info!(
                    branch = %entry.branch_name,
                    tier = tier.as_str(),
                    "merge resolved"
                );
                entry.status = MergeStatus::Merged;
                entry.resolved_tier = Some(tier);
                MergeOutcome {
                    entry,
                    success: true,
                    tier: Some(tier),
                    conflict_files: conflicts,
                    error_message: None,
                }
            }
            Err(e) => {
                tracing::warn!(branch = %entry.branch_name, "merge failed: {e}");
                entry.status = MergeStatus::Failed;
                entry.resolved_tier = None;
                MergeOutcome {
                    entry,
                    success: false,
                    tier: None,
                    conflict_files: conflicts,
                    error_message: Some(e.to_string()),
                }
            }
        }
    }

    fn run_tiers(
        &self,
        entry: &MergeEntry,
        conflicts: &mut Vec<String>,
    ) -> Result<MergeTier, MergeError> {
        self.git_ok("checkout", &["checkout", self.canonical])?;

        // Tier 1: clean merge
        let merge = self.git(&["merge", "--no-edit", &entry.branch_name])?;
        if merge.success() {
            return Ok(MergeTier::CleanMerge);
        }
        if !merge.combined().contains("CONFLICT") {
            return Err(MergeError::Git {
                op: "merge".into(),
                stderr: stderr_excerpt(&merge.combined()),
            });
        }

        // Tier 2: strip markers, keep the incoming side
        let conflicted = self.conflicted_paths()?;
        conflicts.extend(conflicted.iter().cloned());
        let mut residual = Vec::new();
        for path in &conflicted {
            let full = self.repo_root.join(path);
            match std::fs::read_to_string(&full) {
                Ok(content) => match strip_conflict_markers(&content) {
                    Some(resolved) => std::fs::write(&full, resolved)?,
                    None => residual.push(path.clone()),
                },
                // Gone from the working copy (delete/delete and friends):
                // nothing tier 2 can strip.
                Err(_) => residual.push(path.clone()),
            }
        }
        if residual.is_empty() {
            self.stage(&conflicted)?;
            self.git_ok("commit", &["commit", "--no-edit"])?;
            return Ok(MergeTier::AutoResolve);
        }

        // Tier 3: AI resolve, if enabled
        if self.settings.ai_resolve_enabled {
            match self.ai_resolve(entry, &residual) {
                Ok(()) => return Ok(MergeTier::AiResolve),
                Err(e) => {
                    tracing::warn!(branch = %entry.branch_name, "ai-resolve failed: {e}");
                }
            }
        }

        // Tier 4: reimagine, if enabled
        if !self.settings.reimagine_enabled {
            return Err(MergeError::Unresolved {
                branch: entry.branch_name.clone(),
                count: residual.len(),
            });
        }
        self.git(&["merge", "--abort"])?;
        self.reimagine(entry)?;
        Ok(MergeTier::Reimagine)
    }

    fn conflicted_paths(&self) -> Result<Vec<String>, MergeError> {
        let out = self.git_ok("diff", &["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn stage(&self, paths: &[String]) -> Result<(), MergeError> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add".to_string()];
        args.extend(paths.iter().cloned());
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git_ok("add", &argv)?;
        Ok(())
    }

    fn prompt_for(&self, template: &str, entry: &MergeEntry, path: &str) -> String {
        template
            .replace("{path}", path)
            .replace("{branch}", &entry.branch_name)
            .replace("{canonical}", self.canonical)
    }

    /// Tier 3: each residual file goes to the assistant whole; its stdout
    /// becomes the new content.
    fn ai_resolve(&self, entry: &MergeEntry, residual: &[String]) -> Result<(), MergeError> {
        for path in residual {
            let full = self.repo_root.join(path);
            let current = std::fs::read_to_string(&full).unwrap_or_default();
            let prompt = format!(
                "{}\n\nCurrent content of {path}:\n{current}",
                self.prompt_for(&self.settings.resolve_prompt, entry, path)
            );
            let resolved = self
                .assistant
                .complete(&prompt)
                .map_err(|e| MergeError::Assistant(e.to_string()))?;
            std::fs::write(&full, resolved)?;
        }
        self.stage(residual)?;
        self.git_ok("commit", &["commit", "--no-edit"])?;
        Ok(())
    }

    /// Tier 4: abandon the merge and reapply the branch's intent file by
    /// file onto the canonical version.
    fn reimagine(&self, entry: &MergeEntry) -> Result<(), MergeError> {
        for path in &entry.files_modified {
            let canonical_version = self.show_file(self.canonical, path).unwrap_or_default();
            let branch_version = match self.show_file(&entry.branch_name, path) {
                Some(v) => v,
                // The branch never carried this file; nothing to reapply.
                None => continue,
            };
            let prompt = format!(
                "{}\n\nCanonical version of {path}:\n{canonical_version}\n\n\
                 Branch version of {path}:\n{branch_version}",
                self.prompt_for(&self.settings.reimagine_prompt, entry, path)
            );
            let rewritten = self
                .assistant
                .complete(&prompt)
                .map_err(|e| MergeError::Assistant(e.to_string()))?;
            let full = self.repo_root.join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&full, rewritten)?;
        }
        self.stage(&entry.files_modified)?;
        let message = format!("reimagine {} onto {}", entry.branch_name, self.canonical);
        self.git_ok("commit", &["commit", "-m", &message])?;
        Ok(())
    }

    fn show_file(&self, rev: &str, path: &str) -> Option<String> {
        let spec = format!("{rev}:{path}");
        let out = self.git(&["show", &spec]).ok()?;
        out.success().then_some(out.stdout)
    }

    /// Abort anything still in progress and drop stray writes so the
    /// working copy reports clean whatever happened above.
    fn restore_clean_state(&self) {
        let _ = self.git(&["merge", "--abort"]);
        if let Ok(status) = self.git(&["status", "--porcelain"]) {
            if status.success() && !status.stdout.trim().is_empty() {
                let _ = self.git(&["reset", "--hard", "HEAD"]);
            }
        }
    }
}
