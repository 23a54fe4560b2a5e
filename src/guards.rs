use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::agent::Capability;

/// Relative location of the policy file inside an agent's checkout. The
/// hosted assistant runtime reads it at hook time; overstory only writes it.
pub const POLICY_REL_PATH: &str = ".claude/hooks/overstory-policy.json";

/// Declarative hook policy for one agent. The deployer never interprets
/// any of this; the runtime's pre-tool-use hook does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardPolicy {
    pub agent: String,
    pub capability: Capability,
    /// Write/Edit operations must resolve inside this root.
    pub write_root: PathBuf,
    /// Tools this capability may not invoke at all.
    pub denied_tools: Vec<String>,
    /// No pushes and no destructive history rewrites on these.
    pub protected_branches: Vec<String>,
    /// The runtime's native sub-agent spawners; all spawning goes through
    /// the lifecycle manager instead.
    pub blocked_spawn_tools: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("failed to write guard policy: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode guard policy: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tools a capability may never call. Scouts and reviewers are read-only;
/// everyone else is confined by `write_root` instead.
fn denied_tools(capability: Capability) -> Vec<String> {
    match capability {
        Capability::Scout | Capability::Reviewer => {
            vec!["Write".into(), "Edit".into(), "MultiEdit".into()]
        }
        _ => Vec::new(),
    }
}

impl GuardPolicy {
    pub fn for_agent(
        agent: &str,
        capability: Capability,
        checkout: &Path,
        canonical_branch: &str,
    ) -> Self {
        Self {
            agent: agent.to_string(),
            capability,
            write_root: checkout.to_path_buf(),
            denied_tools: denied_tools(capability),
            protected_branches: vec![canonical_branch.to_string()],
            blocked_spawn_tools: vec!["Task".into(), "Agent".into()],
        }
    }
}

/// Write the policy into the checkout and mirror it under
/// `.overstory/hooks/{agent}.json`. Returns the in-checkout path.
pub fn deploy(
    checkout: &Path,
    hooks_dir: &Path,
    policy: &GuardPolicy,
) -> Result<PathBuf, GuardError> {
    let json = serde_json::to_string_pretty(policy)?;

    let policy_path = checkout.join(POLICY_REL_PATH);
    if let Some(parent) = policy_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&policy_path, &json)?;

    std::fs::create_dir_all(hooks_dir)?;
    std::fs::write(hooks_dir.join(format!("{}.json", policy.agent)), &json)?;

    Ok(policy_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scouts_and_reviewers_cannot_write() {
        for cap in [Capability::Scout, Capability::Reviewer] {
            let policy = GuardPolicy::for_agent("eyes", cap, Path::new("/wt/eyes"), "main");
            assert!(policy.denied_tools.contains(&"Write".to_string()));
            assert!(policy.denied_tools.contains(&"Edit".to_string()));
        }
    }

    #[test]
    fn builders_write_within_checkout_only() {
        let policy =
            GuardPolicy::for_agent("impl", Capability::Builder, Path::new("/wt/impl"), "main");
        assert!(policy.denied_tools.is_empty());
        assert_eq!(policy.write_root, Path::new("/wt/impl"));
    }

    #[test]
    fn canonical_branch_is_protected() {
        let policy =
            GuardPolicy::for_agent("impl", Capability::Builder, Path::new("/wt/impl"), "main");
        assert_eq!(policy.protected_branches, vec!["main".to_string()]);
    }

    #[test]
    fn native_spawn_tools_always_blocked() {
        let policy = GuardPolicy::for_agent("lead-1", Capability::Lead, Path::new("/wt/l"), "main");
        assert!(policy.blocked_spawn_tools.contains(&"Task".to_string()));
    }

    #[test]
    fn deploy_writes_checkout_and_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let checkout = dir.path().join("wt/impl");
        let hooks = dir.path().join("hooks");
        std::fs::create_dir_all(&checkout).unwrap();

        let policy = GuardPolicy::for_agent("impl", Capability::Builder, &checkout, "main");
        let written = deploy(&checkout, &hooks, &policy).unwrap();

        assert_eq!(written, checkout.join(POLICY_REL_PATH));
        let from_checkout: GuardPolicy =
            serde_json::from_str(&std::fs::read_to_string(&written).unwrap()).unwrap();
        let from_mirror: GuardPolicy =
            serde_json::from_str(&std::fs::read_to_string(hooks.join("impl.json")).unwrap())
                .unwrap();
        assert_eq!(from_checkout, policy);
        assert_eq!(from_mirror, policy);
    }
}
