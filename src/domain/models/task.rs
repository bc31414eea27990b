//! Task domain model.
//!
//! Tasks are discrete units of work that agents claim and execute.
//! They form a DAG through ID-based dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a task in the execution pipeline.
///
/// Serialized with variant names as strings; the task file on disk is
/// consumed by external tooling and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Task is defined; may or may not be claimable yet.
    Pending,
    /// Task has been claimed by an agent and is being worked on.
    InProgress,
    /// Task finished successfully.
    Completed,
    /// Task failed with no retries remaining.
    Failed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Priority level for tasks.
///
/// Claiming scans the critical/high bucket before the medium/low bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "normal" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Whether this priority belongs to the urgent claim bucket.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }
}

/// Progress of a completed task through the merge pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeState {
    /// Not yet handed to the merge queue.
    Pending,
    /// Enqueued, waiting for dependencies to merge.
    Queued,
    /// Merge in flight.
    Merging,
    /// Branch landed on the target branch.
    Merged,
    /// Merge stopped on conflicting files.
    ConflictDetected,
    /// Conflicts were resolved by negotiation; merge retried.
    Resolved,
    /// Merge is terminally failed; needs manual intervention.
    Failed,
}

impl Default for MergeState {
    fn default() -> Self {
        Self::Pending
    }
}

/// Outcome recorded when a task completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    /// Commit SHA of the work in the agent's branch.
    pub commit_sha: Option<String>,
    /// Files modified while executing the task.
    pub modified_files: Vec<String>,
    /// Wall-clock execution time in milliseconds.
    pub duration_ms: u64,
}

/// A unit of assigned work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable ID, sequential within a decomposition batch (e.g. `task-3`).
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub status: TaskStatus,
    /// IDs of tasks that must complete before this one is claimable.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Files the task is expected to touch. Advisory only; drives overlap
    /// warnings and merge ordering hints.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub merge_state: MergeState,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_max_retries() -> u32 {
    2
}

impl Task {
    /// Create a task with defaults. The ID may be empty; the store assigns
    /// sequential IDs to unnamed tasks at insertion.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            title: title.into(),
            description: description.into(),
            priority: TaskPriority::default(),
            status: TaskStatus::default(),
            depends_on: Vec::new(),
            files: Vec::new(),
            claimed_by: None,
            claimed_at: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            result: None,
            error: None,
            merge_state: MergeState::default(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    #[must_use]
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Revert a claim, returning the task to the claimable pool.
    pub fn release_claim(&mut self) {
        self.status = TaskStatus::Pending;
        self.claimed_by = None;
        self.claimed_at = None;
    }
}

/// Counts per status plus overall completion, as reported by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    /// Completed tasks as a percentage of all tasks (0 when empty).
    pub completion_percent: f64,
}

impl TaskStatistics {
    /// True when nothing is pending or running.
    pub fn all_terminal(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}
