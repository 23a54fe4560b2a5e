use std::path::{Path, PathBuf};

use crate::process::{self, ProcessError, stderr_excerpt};

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub path: PathBuf,
    pub head: String,
    /// Branch name with the `refs/heads/` prefix stripped.
    pub branch: String,
}

#[derive(Debug, Clone)]
pub struct CreatedWorktree {
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("git {op} failed: {stderr}")]
    Git { op: &'static str, stderr: String },
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Agent branches follow `overstory/{agent}/{task}`.
pub fn branch_name(agent_name: &str, task_id: &str) -> String {
    format!("overstory/{agent_name}/{task_id}")
}

fn git(repo_root: &Path, args: &[&str]) -> Result<process::CmdOutput, WorktreeError> {
    let mut argv = vec!["git"];
    argv.extend_from_slice(args);
    Ok(process::run(&argv, Some(repo_root))?)
}

/// Add an isolated checkout for an agent on a fresh branch off `base_branch`.
/// Fails if the branch already exists or the path is occupied; git's stderr
/// is surfaced verbatim.
pub fn create(
    repo_root: &Path,
    base_dir: &Path,
    agent_name: &str,
    base_branch: &str,
    task_id: &str,
) -> Result<CreatedWorktree, WorktreeError> {
    let branch = branch_name(agent_name, task_id);
    let path = base_dir.join(agent_name);
    std::fs::create_dir_all(base_dir)?;

    let path_str = path.to_string_lossy().into_owned();
    let out = git(
        repo_root,
        &["worktree", "add", "-b", &branch, &path_str, base_branch],
    )?;
    if !out.success() {
        return Err(WorktreeError::Git {
            op: "worktree add",
            stderr: stderr_excerpt(&out.stderr),
        });
    }
    Ok(CreatedWorktree { path, branch })
}

/// Enumerate checkouts via the porcelain listing.
pub fn list(repo_root: &Path) -> Result<Vec<Worktree>, WorktreeError> {
    let out = git(repo_root, &["worktree", "list", "--porcelain"])?;
    if !out.success() {
        return Err(WorktreeError::Git {
            op: "worktree list",
            stderr: stderr_excerpt(&out.stderr),
        });
    }
    Ok(parse_porcelain(&out.stdout))
}

/// Parse `worktree list --porcelain` output: blank-line-separated stanzas of
/// `worktree <path>` / `HEAD <sha>` / `branch <ref>` lines. Bare and
/// detached stanzas carry no branch and are skipped.
fn parse_porcelain(output: &str) -> Vec<Worktree> {
    let mut entries = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head = String::new();
    let mut branch: Option<String> = None;

    let mut flush = |path: &mut Option<PathBuf>, head: &mut String, branch: &mut Option<String>| {
        if let (Some(p), Some(b)) = (path.take(), branch.take()) {
            entries.push(Worktree {
                path: p,
                head: std::mem::take(head),
                branch: b,
            });
        } else {
            path.take();
            branch.take();
            head.clear();
        }
    };

    for line in output.lines() {
        if line.is_empty() {
            flush(&mut path, &mut head, &mut branch);
        } else if let Some(p) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(p));
        } else if let Some(h) = line.strip_prefix("HEAD ") {
            head = h.to_string();
        } else if let Some(b) = line.strip_prefix("branch ") {
            branch = Some(b.strip_prefix("refs/heads/").unwrap_or(b).to_string());
        }
    }
    flush(&mut path, &mut head, &mut branch);
    entries
}

/// Two-phase removal: drop the checkout, then try to delete its branch.
/// A branch that won't delete (typically "not fully merged") is left alone;
/// a checkout that won't remove is fatal. When the path is not in the
/// listing the branch-delete step is skipped entirely.
pub fn remove(repo_root: &Path, path: &Path) -> Result<(), WorktreeError> {
    // git prints resolved paths in the listing; compare canonicalized.
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let registered = list(repo_root)?
        .into_iter()
        .find(|wt| wt.path == path || wt.path.canonicalize().is_ok_and(|p| p == target));
    let branch = registered.map(|wt| {
        tracing::debug!(branch = %wt.branch, head = %wt.head, "removing registered checkout");
        wt.branch
    });

    let path_str = path.to_string_lossy().into_owned();
    let out = git(repo_root, &["worktree", "remove", &path_str])?;
    if !out.success() {
        return Err(WorktreeError::Git {
            op: "worktree remove",
            stderr: stderr_excerpt(&out.stderr),
        });
    }

    if let Some(branch) = branch {
        let out = git(repo_root, &["branch", "-d", &branch])?;
        if !out.success() {
            tracing::debug!(%branch, "leaving undeleted branch: {}", out.stderr.trim());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn sh(dir: &Path, args: &[&str]) {
        let status = Command::new(args[0])
            .args(&args[1..])
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(status.status.success(), "command failed: {args:?}");
    }

    fn init_repo(dir: &Path) {
        sh(dir, &["git", "init", "-b", "main"]);
        sh(dir, &["git", "config", "user.email", "test@test.com"]);
        sh(dir, &["git", "config", "user.name", "Test"]);
        std::fs::write(dir.join("README.md"), "# test\n").unwrap();
        sh(dir, &["git", "add", "-A"]);
        sh(dir, &["git", "commit", "-m", "init"]);
    }

    #[test]
    fn branch_name_format() {
        assert_eq!(branch_name("impl", "T1"), "overstory/impl/T1");
    }

    #[test]
    fn create_then_list() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let base = dir.path().join("wt");

        let created = create(dir.path(), &base, "impl", "main", "T1").unwrap();
        assert_eq!(created.branch, "overstory/impl/T1");
        assert!(created.path.join("README.md").exists());

        let listing = list(dir.path()).unwrap();
        assert!(
            listing
                .iter()
                .any(|wt| wt.branch == "overstory/impl/T1" && !wt.head.is_empty())
        );
    }

    #[test]
    fn create_duplicate_branch_fails() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let base = dir.path().join("wt");

        create(dir.path(), &base, "impl", "main", "T1").unwrap();
        let err = create(dir.path(), &base.join("other"), "impl", "main", "T1").unwrap_err();
        assert!(matches!(err, WorktreeError::Git { .. }));
    }

    #[test]
    fn remove_deletes_checkout_and_merged_branch() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let base = dir.path().join("wt");

        let created = create(dir.path(), &base, "impl", "main", "T1").unwrap();
        remove(dir.path(), &created.path).unwrap();
        assert!(!created.path.exists());

        // No commits on the branch, so -d succeeded
        let out = Command::new("git")
            .args(["branch", "--list", "overstory/impl/T1"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&out.stdout).trim().is_empty());
    }

    #[test]
    fn unmerged_branch_survives_removal() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let base = dir.path().join("wt");

        let created = create(dir.path(), &base, "impl", "main", "T1").unwrap();
        std::fs::write(created.path.join("work.txt"), "wip\n").unwrap();
        sh(&created.path, &["git", "add", "-A"]);
        sh(&created.path, &["git", "commit", "-m", "wip"]);

        // Checkout removal must succeed even though branch -d will refuse
        remove(dir.path(), &created.path).unwrap();
        assert!(!created.path.exists());

        let out = Command::new("git")
            .args(["branch", "--list", "overstory/impl/T1"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&out.stdout).contains("overstory/impl/T1"));
    }

    #[test]
    fn remove_unlisted_path_skips_branch_delete() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        // A plain directory git never registered: the removal itself still
        // runs (and fails), but no branch-delete is attempted.
        let stray = dir.path().join("stray");
        std::fs::create_dir_all(&stray).unwrap();
        let err = remove(dir.path(), &stray).unwrap_err();
        assert!(matches!(err, WorktreeError::Git { op: "worktree remove", .. }));
        assert!(stray.exists());
    }

    #[test]
    fn parse_porcelain_strips_refs_prefix() {
        let raw = "worktree /repo\n\
                   HEAD 1111111111111111111111111111111111111111\n\
                   branch refs/heads/main\n\
                   \n\
                   worktree /repo/.overstory/worktrees/impl\n\
                   HEAD 2222222222222222222222222222222222222222\n\
                   branch refs/heads/overstory/impl/T1\n";
        let parsed = parse_porcelain(raw);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].branch, "main");
        assert_eq!(parsed[1].branch, "overstory/impl/T1");
        assert_eq!(
            parsed[1].path,
            PathBuf::from("/repo/.overstory/worktrees/impl")
        );
    }

    #[test]
    fn parse_porcelain_skips_detached_and_bare() {
        let raw = "worktree /repo\n\
                   bare\n\
                   \n\
                   worktree /repo/detached\n\
                   HEAD 3333333333333333333333333333333333333333\n\
                   detached\n";
        assert!(parse_porcelain(raw).is_empty());
    }
}
