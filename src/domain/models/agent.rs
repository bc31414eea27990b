//! Agent domain model.
//!
//! An agent is a live worker bound to one worktree, one model, and one
//! mailbox. Its lifecycle is a state machine driven by the claim loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::provider::ModelSpec;

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentState {
    /// Worktree and context are being prepared.
    Spawning,
    /// Context loaded; about to enter the claim loop.
    Ready,
    /// Scanning the store for claimable work.
    Claiming,
    /// Waiting for the lead to approve a proposed plan.
    PlanningWork,
    /// Executing a claimed task.
    Working,
    /// No claimable work; backing off between polls.
    Idle,
    /// Shutdown accepted; finishing current activity.
    ShuttingDown,
    /// Terminal. The record lingers briefly for observers, then is discarded.
    Stopped,
    /// Terminal error state; the task (if any) has been released.
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawning => "Spawning",
            Self::Ready => "Ready",
            Self::Claiming => "Claiming",
            Self::PlanningWork => "PlanningWork",
            Self::Working => "Working",
            Self::Idle => "Idle",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

/// Instructions for spawning one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub model: ModelSpec,
    /// Extra standing instructions folded into every task prompt.
    #[serde(default)]
    pub spawn_prompt: Option<String>,
    /// When set, the agent submits a plan and waits for lead approval
    /// before touching any file.
    #[serde(default)]
    pub require_plan_approval: bool,
}

/// Running statistics for one agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AgentStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub output_bytes: u64,
}

/// The orchestrator-owned record of a live agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// `agent-N` for pool agents, `task-agent-{uuid}` for ephemeral ones.
    pub agent_id: String,
    pub name: String,
    pub model: ModelSpec,
    pub state: AgentState,
    pub worktree_path: String,
    pub branch: String,
    #[serde(default)]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub spawn_prompt: Option<String>,
    #[serde(default)]
    pub require_plan_approval: bool,
    pub state_entered_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: AgentStats,
}

impl AgentRecord {
    pub fn new(agent_id: String, spec: &AgentSpec, worktree_path: String, branch: String) -> Self {
        Self {
            agent_id,
            name: spec.name.clone(),
            model: spec.model.clone(),
            state: AgentState::Spawning,
            worktree_path,
            branch,
            current_task_id: None,
            spawn_prompt: spec.spawn_prompt.clone(),
            require_plan_approval: spec.require_plan_approval,
            state_entered_at: Utc::now(),
            stats: AgentStats::default(),
        }
    }

    /// ID for an ephemeral single-task agent.
    pub fn ephemeral_id() -> String {
        format!("task-agent-{}", Uuid::new_v4())
    }

    pub fn enter_state(&mut self, state: AgentState) {
        self.state = state;
        self.state_entered_at = Utc::now();
    }

    /// Seconds spent in the current state.
    pub fn seconds_in_state(&self) -> i64 {
        (Utc::now() - self.state_entered_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> AgentSpec {
        AgentSpec {
            name: "builder".to_string(),
            model: ModelSpec::new("claude", "sonnet"),
            spawn_prompt: None,
            require_plan_approval: false,
        }
    }

    #[test]
    fn test_new_record_starts_spawning() {
        let rec = AgentRecord::new("agent-1".into(), &spec(), "/wt".into(), "b".into());
        assert_eq!(rec.state, AgentState::Spawning);
        assert!(rec.current_task_id.is_none());
    }

    #[test]
    fn test_enter_state_updates_timestamp() {
        let mut rec = AgentRecord::new("agent-1".into(), &spec(), "/wt".into(), "b".into());
        let before = rec.state_entered_at;
        rec.enter_state(AgentState::Ready);
        assert_eq!(rec.state, AgentState::Ready);
        assert!(rec.state_entered_at >= before);
    }

    #[test]
    fn test_terminal_states() {
        assert!(AgentState::Stopped.is_terminal());
        assert!(AgentState::Error.is_terminal());
        assert!(!AgentState::Idle.is_terminal());
    }

    #[test]
    fn test_ephemeral_id_prefix() {
        assert!(AgentRecord::ephemeral_id().starts_with("task-agent-"));
    }
}
