use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::{self, OverstoryConfig};
use crate::guards::{self, GuardError, GuardPolicy};
use crate::mailbox::{MailError, Mailbox};
use crate::overlay::{self, OverlayContext, OverlayError};
use crate::session::{self, SessionError};
use crate::worktree::{self, WorktreeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// "supervisor" is accepted as a legacy alias.
    #[value(alias = "supervisor")]
    Coordinator,
    Lead,
    Builder,
    Scout,
    Reviewer,
    Merger,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Lead => "lead",
            Self::Builder => "builder",
            Self::Scout => "scout",
            Self::Reviewer => "reviewer",
            Self::Merger => "merger",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "coordinator" | "supervisor" => Self::Coordinator,
            "lead" => Self::Lead,
            "builder" => Self::Builder,
            "scout" => Self::Scout,
            "reviewer" => Self::Reviewer,
            "merger" => Self::Merger,
            _ => return None,
        })
    }

    /// Only coordinators and leads may spawn sub-agents.
    pub fn can_spawn(self) -> bool {
        matches!(self, Self::Coordinator | Self::Lead)
    }

    /// Worker capabilities must name the agent that spawned them.
    pub fn requires_parent(self) -> bool {
        !self.can_spawn()
    }
}

/// One live agent: its checkout, branch, and terminal session. Mirrored
/// into the mail store so a restarted orchestrator can reattach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub capability: Capability,
    pub task_id: String,
    /// Empty for coordinators and leads.
    pub parent: String,
    pub depth: u32,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub session_pid: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn session_name(&self) -> String {
        session::session_name(&self.name)
    }
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub name: String,
    pub capability: Capability,
    pub task_id: String,
    pub parent: String,
    pub depth: u32,
    pub spec_path: Option<String>,
    pub file_scope: Vec<String>,
    /// Defaults to the canonical branch.
    pub base_branch: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid spawn request: {0}")]
    Validation(String),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    #[error(transparent)]
    Mail(#[from] MailError),
}

/// Everything torn down, and everything that resisted. Teardown always
/// makes progress; failures are reported, never thrown.
#[derive(Debug)]
pub struct TeardownReport {
    pub name: String,
    pub errors: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// spawn and teardown for one agent name never interleave.
fn name_lock(name: &str) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    let map = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = map.lock().unwrap_or_else(|e| e.into_inner());
    guard.entry(name.to_string()).or_default().clone()
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub struct AgentManager<'a> {
    repo_root: PathBuf,
    config: &'a OverstoryConfig,
    store: &'a Mailbox,
}

impl<'a> AgentManager<'a> {
    pub fn new(repo_root: &Path, config: &'a OverstoryConfig, store: &'a Mailbox) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            config,
            store,
        }
    }

    fn validate(&self, req: &SpawnRequest) -> Result<(), AgentError> {
        let reject = |msg: String| Err(AgentError::Validation(msg));

        if !valid_name(&req.name) {
            return reject(format!(
                "agent name '{}' must be non-empty alphanumeric/dash/underscore",
                req.name
            ));
        }
        if req.task_id.trim().is_empty() {
            return reject("task id must not be empty".into());
        }
        let max_depth = self.config.agents.max_depth;
        if req.depth > max_depth {
            return reject(format!(
                "depth {} exceeds max_depth {max_depth}",
                req.depth
            ));
        }
        if req.capability.requires_parent() && req.parent.trim().is_empty() {
            return reject(format!(
                "{} agents require a parent",
                req.capability.as_str()
            ));
        }
        if !req.parent.is_empty() {
            if let Some(parent) = self.store.get_agent(&req.parent)? {
                if !parent.capability.can_spawn() {
                    return reject(format!(
                        "parent '{}' ({}) cannot spawn",
                        parent.name,
                        parent.capability.as_str()
                    ));
                }
                // Agents on the last usable level cannot spawn further.
                if parent.depth + 1 >= max_depth {
                    return reject(format!(
                        "parent '{}' at depth {} cannot spawn (max_depth {max_depth})",
                        parent.name, parent.depth
                    ));
                }
            }
        }
        if self.store.get_agent(&req.name)?.is_some() {
            return reject(format!("agent '{}' already exists", req.name));
        }
        if session::is_alive(&session::session_name(&req.name)) {
            return reject(format!(
                "session '{}' already exists",
                session::session_name(&req.name)
            ));
        }
        Ok(())
    }

    /// Allocate checkout, overlay, guards, session, then fire the task
    /// beacon. Any step failing unwinds everything already done.
    pub fn spawn(&self, req: &SpawnRequest) -> Result<AgentRecord, AgentError> {
        let lock = name_lock(&req.name);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        self.validate(req)?;

        let base_branch = req
            .base_branch
            .clone()
            .unwrap_or_else(|| self.config.repo.canonical_branch.clone());
        let created = worktree::create(
            &self.repo_root,
            &config::worktrees_dir(&self.repo_root),
            &req.name,
            &base_branch,
            &req.task_id,
        )?;

        let mut record = AgentRecord {
            name: req.name.clone(),
            capability: req.capability,
            task_id: req.task_id.clone(),
            parent: req.parent.clone(),
            depth: req.depth,
            branch: created.branch.clone(),
            worktree_path: created.path.clone(),
            session_pid: None,
            created_at: Utc::now(),
        };

        match self.provision(&mut record, req) {
            Ok(()) => Ok(record),
            Err(e) => {
                self.rollback(&record);
                Err(e)
            }
        }
    }

    fn provision(&self, record: &mut AgentRecord, req: &SpawnRequest) -> Result<(), AgentError> {
        overlay::materialize(
            &record.worktree_path,
            &OverlayContext {
                agent_name: &record.name,
                capability: record.capability,
                task_id: &record.task_id,
                depth: record.depth,
                can_spawn: record.capability.can_spawn()
                    && record.depth + 1 < self.config.agents.max_depth,
                spec_path: req.spec_path.as_deref(),
                file_scope: &req.file_scope,
            },
        )?;

        let policy = GuardPolicy::for_agent(
            &record.name,
            record.capability,
            &record.worktree_path,
            &self.config.repo.canonical_branch,
        );
        guards::deploy(
            &record.worktree_path,
            &config::hooks_dir(&self.repo_root),
            &policy,
        )?;

        let assistant = crate::assistant::Assistant::from_config(&self.config.assistant);
        let pid = session::create(
            &record.session_name(),
            &record.worktree_path,
            &assistant.interactive_command(),
        )?;
        record.session_pid = Some(pid);
        self.store.upsert_agent(record)?;

        std::thread::sleep(std::time::Duration::from_millis(
            self.config.agents.stagger_delay_ms,
        ));
        session::send_keys(&record.session_name(), &self.task_beacon(record))?;
        Ok(())
    }

    fn task_beacon(&self, record: &AgentRecord) -> String {
        format!(
            "Read CLAUDE.md in this directory. You are {} ({}), assigned task {}. \
             Check mail with `overstory mail check --inject --agent {}`, then begin.",
            record.name,
            record.capability.as_str(),
            record.task_id,
            record.name,
        )
    }

    fn rollback(&self, record: &AgentRecord) {
        let session = record.session_name();
        if session::is_alive(&session) {
            if let Err(e) = session::kill(&session) {
                tracing::warn!(agent = %record.name, "rollback: kill session failed: {e}");
            }
        }
        if record.worktree_path.exists() {
            if let Err(e) = worktree::remove(&self.repo_root, &record.worktree_path) {
                tracing::warn!(agent = %record.name, "rollback: remove worktree failed: {e}");
            }
        }
        if let Err(e) = self.store.remove_agent(&record.name) {
            tracing::warn!(agent = %record.name, "rollback: remove record failed: {e}");
        }
    }

    /// Best-effort, idempotent teardown: kill the session if alive, drop
    /// the checkout, forget the record. Collects failures instead of
    /// propagating them.
    pub fn teardown(&self, name: &str) -> TeardownReport {
        let lock = name_lock(name);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut errors = Vec::new();

        let session = session::session_name(name);
        if session::is_alive(&session) {
            if let Err(e) = session::kill(&session) {
                errors.push(format!("kill session: {e}"));
            }
        }

        let path = match self.store.get_agent(name) {
            Ok(Some(rec)) => rec.worktree_path,
            _ => config::worktrees_dir(&self.repo_root).join(name),
        };
        if path.exists() {
            if let Err(e) = worktree::remove(&self.repo_root, &path) {
                errors.push(format!("remove worktree: {e}"));
            }
        }

        if let Err(e) = self.store.remove_agent(name) {
            errors.push(format!("forget record: {e}"));
        }

        TeardownReport {
            name: name.to_string(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, capability: Capability, depth: u32) -> AgentRecord {
        AgentRecord {
            name: name.into(),
            capability,
            task_id: "T1".into(),
            parent: String::new(),
            depth,
            branch: format!("overstory/{name}/T1"),
            worktree_path: format!("/tmp/wt/{name}").into(),
            session_pid: None,
            created_at: Utc::now(),
        }
    }

    fn request(name: &str, capability: Capability, parent: &str, depth: u32) -> SpawnRequest {
        SpawnRequest {
            name: name.into(),
            capability,
            task_id: "T1".into(),
            parent: parent.into(),
            depth,
            spec_path: None,
            file_scope: vec![],
            base_branch: None,
        }
    }

    struct Fixture {
        store: Mailbox,
        config: OverstoryConfig,
        _dir: tempfile::TempDir,
        root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        Fixture {
            store: Mailbox::in_memory().unwrap(),
            config: OverstoryConfig::default(),
            _dir: dir,
            root,
        }
    }

    #[test]
    fn capability_spawn_rights() {
        assert!(Capability::Coordinator.can_spawn());
        assert!(Capability::Lead.can_spawn());
        for cap in [Capability::Builder, Capability::Scout, Capability::Reviewer] {
            assert!(!cap.can_spawn());
            assert!(cap.requires_parent());
        }
    }

    #[test]
    fn supervisor_alias_parses_as_coordinator() {
        assert_eq!(Capability::parse("supervisor"), Some(Capability::Coordinator));
        assert_eq!(Capability::parse("builder"), Some(Capability::Builder));
        assert_eq!(Capability::parse("wizard"), None);
    }

    #[test]
    fn builder_without_parent_rejected() {
        let f = fixture();
        let mgr = AgentManager::new(&f.root, &f.config, &f.store);
        let err = mgr
            .validate(&request("impl", Capability::Builder, "", 1))
            .unwrap_err();
        assert!(err.to_string().contains("require a parent"));
    }

    #[test]
    fn depth_over_max_rejected() {
        let f = fixture();
        let mgr = AgentManager::new(&f.root, &f.config, &f.store);
        let err = mgr
            .validate(&request("impl", Capability::Builder, "lead", 4))
            .unwrap_err();
        assert!(err.to_string().contains("max_depth"));
    }

    #[test]
    fn spawn_from_last_level_parent_rejected() {
        let f = fixture();
        // max_depth = 3: an agent at depth 2 is on the last level
        let mut parent = record("lead-deep", Capability::Lead, 2);
        parent.parent = "root".into();
        f.store.upsert_agent(&parent).unwrap();

        let mgr = AgentManager::new(&f.root, &f.config, &f.store);
        let err = mgr
            .validate(&request("impl", Capability::Builder, "lead-deep", 3))
            .unwrap_err();
        assert!(err.to_string().contains("cannot spawn"));
    }

    #[test]
    fn spawn_onto_last_level_allowed() {
        let f = fixture();
        // Parent at depth 1 may create a child at depth 2 == max_depth - 1
        f.store
            .upsert_agent(&record("lead", Capability::Lead, 1))
            .unwrap();
        let mgr = AgentManager::new(&f.root, &f.config, &f.store);
        mgr.validate(&request("impl", Capability::Builder, "lead", 2))
            .unwrap();
    }

    #[test]
    fn non_spawning_parent_rejected() {
        let f = fixture();
        f.store
            .upsert_agent(&record("scout-1", Capability::Scout, 1))
            .unwrap();
        let mgr = AgentManager::new(&f.root, &f.config, &f.store);
        let err = mgr
            .validate(&request("impl", Capability::Builder, "scout-1", 2))
            .unwrap_err();
        assert!(err.to_string().contains("cannot spawn"));
    }

    #[test]
    fn duplicate_name_rejected() {
        let f = fixture();
        f.store
            .upsert_agent(&record("impl", Capability::Builder, 1))
            .unwrap();
        let mgr = AgentManager::new(&f.root, &f.config, &f.store);
        let err = mgr
            .validate(&request("impl", Capability::Builder, "lead", 1))
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn hostile_names_rejected() {
        let f = fixture();
        let mgr = AgentManager::new(&f.root, &f.config, &f.store);
        for name in ["", "has space", "slash/y", "dot.dot"] {
            assert!(
                mgr.validate(&request(name, Capability::Lead, "", 0)).is_err(),
                "name {name:?} should be rejected"
            );
        }
    }

    #[test]
    fn teardown_of_unknown_agent_is_clean() {
        let f = fixture();
        let mgr = AgentManager::new(&f.root, &f.config, &f.store);
        let report = mgr.teardown("ghost");
        assert!(report.is_clean());
        // And again: idempotent
        assert!(mgr.teardown("ghost").is_clean());
    }

    #[test]
    fn teardown_forgets_record() {
        let f = fixture();
        f.store
            .upsert_agent(&record("impl", Capability::Builder, 1))
            .unwrap();
        let mgr = AgentManager::new(&f.root, &f.config, &f.store);
        let report = mgr.teardown("impl");
        assert!(report.is_clean(), "errors: {:?}", report.errors);
        assert!(f.store.get_agent("impl").unwrap().is_none());
    }
}
