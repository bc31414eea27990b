//! Cohort, a team coordinator for AI coding agents.
//!
//! A lead orchestrator decomposes a feature request into a dependency-
//! ordered task store, spawns agents that each own an isolated git
//! worktree and a durable mailbox, and merges completed branches back
//! incrementally, negotiating conflicts with AI help when needed.

pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::models::Config;
pub use domain::{CoordError, CoordResult};
