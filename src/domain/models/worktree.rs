//! Worktree record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// An isolated checkout of the repository on a per-agent branch.
///
/// Owned by exactly one agent for its lifetime; the path is disjoint from
/// every other worktree and from the main checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
}

impl Worktree {
    pub fn new(path: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            branch: branch.into(),
            created_at: Utc::now(),
        }
    }
}

/// A file left unmerged by a conflicting merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictedFile {
    /// Path relative to the worktree root.
    pub path: String,
    /// Absolute path on disk.
    pub full_path: PathBuf,
}
