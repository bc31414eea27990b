//! Domain models for the coordination engine.

pub mod agent;
pub mod config;
pub mod message;
pub mod provider;
pub mod task;
pub mod worktree;

pub use agent::{AgentRecord, AgentSpec, AgentState, AgentStats};
pub use config::{Config, LoggingConfig, MergeStrategy, TeamConfig, TeamPaths, TimeoutConfig};
pub use message::{Message, MessageType, BROADCAST, LEAD_ID};
pub use provider::{ModelSpec, PromptDelivery, ProviderConfig, ProviderKind};
pub use task::{MergeState, Task, TaskPriority, TaskResult, TaskStatistics, TaskStatus};
pub use worktree::{ConflictedFile, Worktree};
