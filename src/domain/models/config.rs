//! Configuration model.
//!
//! Loaded by the figment-based loader with hierarchical merging; the
//! effective team portion is snapshotted to `config.json` inside the team
//! directory at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::provider::{ModelSpec, ProviderConfig};

/// Strategy used when landing an agent branch on the target branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Rebase the agent branch onto the target, then `merge --no-ff`.
    RebaseThenMerge,
    /// Check out the target and merge the agent branch directly.
    MergeDirect,
    /// Alias for `RebaseThenMerge`; merges already run one at a time.
    Sequential,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        Self::RebaseThenMerge
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// json | pretty
    pub format: String,
    /// When set, also write logs to a daily-rotated file in this directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            directory: None,
        }
    }
}

/// Timeouts and pacing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// File-lock acquisition timeout in milliseconds.
    pub lock_timeout_ms: u64,
    /// Claims older than this are considered abandoned.
    pub stale_claim_secs: u64,
    /// Grace period for agents to acknowledge a shutdown request.
    pub shutdown_grace_secs: u64,
    /// Silence threshold before the lead sends a status check.
    pub heartbeat_silence_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            stale_claim_secs: 300,
            shutdown_grace_secs: 60,
            heartbeat_silence_secs: 60,
        }
    }
}

/// Team-scoped configuration: what the lead persists to `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Team name; becomes the directory name under `<root>/teams/`.
    pub name: String,
    /// Maximum concurrently active agents.
    pub max_agents: usize,
    /// Branch that completed work merges back to.
    pub target_branch: String,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    /// Require lead approval of a plan before each task's execution.
    #[serde(default)]
    pub require_plan_approval: bool,
    /// Lead coordinates only; its provider calls cannot edit files.
    #[serde(default)]
    pub delegate_mode: bool,
    /// Models handed out round-robin to spawned agents.
    #[serde(default)]
    pub models: Vec<ModelSpec>,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_agents: 3,
            target_branch: "main".to_string(),
            merge_strategy: MergeStrategy::default(),
            require_plan_approval: false,
            delegate_mode: false,
            models: vec![ModelSpec::new("claude", "sonnet")],
        }
    }
}

/// Root configuration for the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// State root; the team directory tree lives underneath.
    pub root_dir: PathBuf,
    #[serde(default)]
    pub team: TeamConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Known providers, referenced by `ModelSpec::provider`.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(".cohort"),
            team: TeamConfig::default(),
            timeouts: TimeoutConfig::default(),
            logging: LoggingConfig::default(),
            providers: Vec::new(),
        }
    }
}

impl Config {
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

/// On-disk layout of one team's shared state.
///
/// ```text
/// <root>/teams/<T>/config.json
/// <root>/teams/<T>/tasks/tasks.json
/// <root>/teams/<T>/tasks/claims.lock
/// <root>/teams/<T>/mailbox/<agentId>.jsonl
/// ```
#[derive(Debug, Clone)]
pub struct TeamPaths {
    pub team_dir: PathBuf,
}

impl TeamPaths {
    pub fn new(root: &Path, team: &str) -> Self {
        Self {
            team_dir: root.join("teams").join(team),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.team_dir.join("config.json")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.team_dir.join("tasks")
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.tasks_dir().join("tasks.json")
    }

    pub fn claims_lock(&self) -> PathBuf {
        self.tasks_dir().join("claims.lock")
    }

    pub fn mailbox_dir(&self) -> PathBuf {
        self.team_dir.join("mailbox")
    }

    pub fn mailbox_file(&self, agent_id: &str) -> PathBuf {
        self.mailbox_dir().join(format!("{agent_id}.jsonl"))
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.team_dir.join("worktrees")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let paths = TeamPaths::new(Path::new("/state"), "alpha");
        assert_eq!(
            paths.tasks_file(),
            PathBuf::from("/state/teams/alpha/tasks/tasks.json")
        );
        assert_eq!(
            paths.claims_lock(),
            PathBuf::from("/state/teams/alpha/tasks/claims.lock")
        );
        assert_eq!(
            paths.mailbox_file("agent-2"),
            PathBuf::from("/state/teams/alpha/mailbox/agent-2.jsonl")
        );
    }

    #[test]
    fn test_default_team_config() {
        let team = TeamConfig::default();
        assert_eq!(team.max_agents, 3);
        assert_eq!(team.target_branch, "main");
        assert_eq!(team.merge_strategy, MergeStrategy::RebaseThenMerge);
        assert!(!team.delegate_mode);
    }

    #[test]
    fn test_provider_lookup() {
        let mut config = Config::default();
        config.providers.push(crate::domain::models::ProviderConfig {
            name: "claude".into(),
            kind: Default::default(),
            command: "claude".into(),
            args: vec![],
            analysis_args: None,
            prompt_delivery: Default::default(),
            stream_json: false,
            env: Default::default(),
        });
        assert!(config.provider("claude").is_some());
        assert!(config.provider("missing").is_none());
    }
}
