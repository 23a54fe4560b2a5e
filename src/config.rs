use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything overstory persists lives under this directory at the repo root.
pub const STATE_DIR: &str = ".overstory";

/// Reserved mail address for the human-driven top-level session.
pub const ORCHESTRATOR: &str = "orchestrator";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OverstoryConfig {
    #[serde(default)]
    pub repo: RepoConfig,
    #[serde(default)]
    pub agents: AgentSettings,
    #[serde(default)]
    pub merge: MergeSettings,
    #[serde(default)]
    pub watchdog: WatchdogSettings,
    #[serde(default)]
    pub assistant: AssistantSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoConfig {
    /// Branch merges land on.
    #[serde(default = "default_canonical_branch")]
    pub canonical_branch: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            canonical_branch: default_canonical_branch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSettings {
    /// Deepest spawn level allowed. Agents at max_depth - 1 cannot spawn.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Delay between creating a session and sending its task beacon.
    #[serde(default = "default_stagger_delay_ms")]
    pub stagger_delay_ms: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            stagger_delay_ms: default_stagger_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeSettings {
    #[serde(default = "default_true")]
    pub ai_resolve_enabled: bool,
    #[serde(default)]
    pub reimagine_enabled: bool,
    /// Tier-3 prompt. Placeholders: {path}, {branch}, {canonical}.
    #[serde(default = "default_resolve_prompt")]
    pub resolve_prompt: String,
    /// Tier-4 prompt. Placeholders: {path}, {branch}, {canonical}.
    #[serde(default = "default_reimagine_prompt")]
    pub reimagine_prompt: String,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            ai_resolve_enabled: default_true(),
            reimagine_enabled: false,
            resolve_prompt: default_resolve_prompt(),
            reimagine_prompt: default_reimagine_prompt(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchdogSettings {
    #[serde(default = "default_tier1_interval_ms")]
    pub tier1_interval_ms: u64,
    /// Quiet this long: agent is stale.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
    /// Quiet this long: agent is a zombie. Must exceed the stale threshold.
    #[serde(default = "default_zombie_threshold_ms")]
    pub zombie_threshold_ms: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            tier1_interval_ms: default_tier1_interval_ms(),
            stale_threshold_ms: default_stale_threshold_ms(),
            zombie_threshold_ms: default_zombie_threshold_ms(),
        }
    }
}

/// Backend + model for the hosted assistant CLI, both the interactive
/// sessions workers run in and the one-shot completions the resolver
/// and watchdog use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantSettings {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Outer bound on one-shot completions; the process group is killed
    /// on expiry.
    #[serde(default = "default_assistant_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            model: default_model(),
            timeout_ms: default_assistant_timeout_ms(),
        }
    }
}

fn default_canonical_branch() -> String {
    "main".into()
}
fn default_max_depth() -> u32 {
    3
}
fn default_stagger_delay_ms() -> u64 {
    2_000
}
fn default_true() -> bool {
    true
}
fn default_tier1_interval_ms() -> u64 {
    30_000
}
fn default_stale_threshold_ms() -> u64 {
    300_000
}
fn default_zombie_threshold_ms() -> u64 {
    600_000
}
fn default_backend() -> String {
    "claude".into()
}
fn default_model() -> String {
    "sonnet".into()
}
fn default_assistant_timeout_ms() -> u64 {
    120_000
}
fn default_resolve_prompt() -> String {
    "The file {path} has unresolved merge conflicts between branch {branch} \
     and {canonical}. Produce the fully resolved file content, nothing else."
        .into()
}
fn default_reimagine_prompt() -> String {
    "Branch {branch} changed {path} but the change no longer applies to \
     {canonical}. Reimplement the branch's intent on top of the canonical \
     version. Output the complete new file content, nothing else."
        .into()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config.toml: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config.toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config.toml: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl OverstoryConfig {
    /// Load from `.overstory/config.toml`. A missing file yields defaults;
    /// a present-but-broken one is fatal.
    pub fn load(repo_root: &Path) -> Result<Self, ConfigError> {
        let path = config_path(repo_root);
        if !path.exists() {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let content = std::fs::read_to_string(&path)?;
        let config: OverstoryConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, repo_root: &Path) -> Result<(), ConfigError> {
        let dir = state_dir(repo_root);
        std::fs::create_dir_all(&dir)?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path(repo_root), content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.max_depth == 0 {
            return Err(ConfigError::Invalid("agents.max_depth must be >= 1".into()));
        }
        if self.watchdog.zombie_threshold_ms <= self.watchdog.stale_threshold_ms {
            return Err(ConfigError::Invalid(format!(
                "watchdog.zombie_threshold_ms ({}) must exceed stale_threshold_ms ({})",
                self.watchdog.zombie_threshold_ms, self.watchdog.stale_threshold_ms
            )));
        }
        Ok(())
    }
}

pub fn state_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(STATE_DIR)
}

pub fn config_path(repo_root: &Path) -> PathBuf {
    state_dir(repo_root).join("config.toml")
}

pub fn mail_db_path(repo_root: &Path) -> PathBuf {
    state_dir(repo_root).join("mail.db")
}

pub fn nudges_dir(repo_root: &Path) -> PathBuf {
    state_dir(repo_root).join("pending-nudges")
}

pub fn worktrees_dir(repo_root: &Path) -> PathBuf {
    state_dir(repo_root).join("worktrees")
}

pub fn hooks_dir(repo_root: &Path) -> PathBuf {
    state_dir(repo_root).join("hooks")
}

pub fn specs_dir(repo_root: &Path) -> PathBuf {
    state_dir(repo_root).join("specs")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TOML: &str = r#"
[repo]
canonical_branch = "trunk"

[agents]
max_depth = 4
stagger_delay_ms = 500

[merge]
ai_resolve_enabled = false
reimagine_enabled = true

[watchdog]
tier1_interval_ms = 10000
stale_threshold_ms = 60000
zombie_threshold_ms = 120000

[assistant]
backend = "codex"
model = "o3"
"#;

    #[test]
    fn parse_full_config() {
        let config: OverstoryConfig = toml::from_str(SAMPLE_TOML).unwrap();
        assert_eq!(config.repo.canonical_branch, "trunk");
        assert_eq!(config.agents.max_depth, 4);
        assert_eq!(config.agents.stagger_delay_ms, 500);
        assert!(!config.merge.ai_resolve_enabled);
        assert!(config.merge.reimagine_enabled);
        assert_eq!(config.watchdog.stale_threshold_ms, 60_000);
        assert_eq!(config.assistant.backend, "codex");
        config.validate().unwrap();
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config: OverstoryConfig = toml::from_str("[repo]\n").unwrap();
        assert_eq!(config.repo.canonical_branch, "main");
        assert_eq!(config.agents.max_depth, 3);
        assert_eq!(config.agents.stagger_delay_ms, 2_000);
        assert!(config.merge.ai_resolve_enabled);
        assert!(!config.merge.reimagine_enabled);
        assert_eq!(config.watchdog.tier1_interval_ms, 30_000);
        assert_eq!(config.watchdog.stale_threshold_ms, 300_000);
        assert_eq!(config.watchdog.zombie_threshold_ms, 600_000);
        assert_eq!(config.assistant.backend, "claude");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OverstoryConfig::load(dir.path()).unwrap();
        assert_eq!(config, OverstoryConfig::default());
    }

    #[test]
    fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OverstoryConfig::default();
        config.repo.canonical_branch = "develop".into();
        config.save(dir.path()).unwrap();
        let loaded = OverstoryConfig::load(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn zombie_must_exceed_stale() {
        let mut config = OverstoryConfig::default();
        config.watchdog.zombie_threshold_ms = config.watchdog.stale_threshold_ms;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("zombie_threshold_ms"));
    }

    #[test]
    fn zero_max_depth_rejected() {
        let mut config = OverstoryConfig::default();
        config.agents.max_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn prompt_templates_have_placeholders() {
        let config = OverstoryConfig::default();
        for prompt in [&config.merge.resolve_prompt, &config.merge.reimagine_prompt] {
            assert!(prompt.contains("{path}"));
            assert!(prompt.contains("{branch}"));
            assert!(prompt.contains("{canonical}"));
        }
    }

    #[test]
    fn state_paths_nest_under_overstory() {
        let root = Path::new("/repo");
        assert_eq!(mail_db_path(root), Path::new("/repo/.overstory/mail.db"));
        assert_eq!(
            nudges_dir(root),
            Path::new("/repo/.overstory/pending-nudges")
        );
        assert_eq!(worktrees_dir(root), Path::new("/repo/.overstory/worktrees"));
    }
}
