//! Git worktree management.
//!
//! Creates, removes, commits, and queries isolated worktrees over the
//! `git` binary. No library bindings; every call goes through the shared
//! subprocess runner so output is always drained concurrently.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::domain::models::ConflictedFile;
use crate::domain::{CoordError, CoordResult};
use crate::infrastructure::process::{run, CommandOutput};

/// Manager for the repository at `repo_root` and its worktrees.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_root: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Run git in `cwd`, returning the raw result regardless of exit code.
    pub async fn run_git(&self, cwd: &Path, args: &[&str]) -> CoordResult<CommandOutput> {
        run(cwd, "git", args).await
    }

    /// Run git in `cwd` and fail with a stderr excerpt on non-zero exit.
    async fn git_ok(&self, cwd: &Path, args: &[&str]) -> CoordResult<CommandOutput> {
        let out = self.run_git(cwd, args).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(CoordError::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                out.stderr_excerpt()
            )))
        }
    }

    /// Name of the branch currently checked out in the main repository.
    pub async fn current_branch(&self) -> CoordResult<String> {
        let out = self
            .git_ok(&self.repo_root, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Create a worktree at `path` on a new branch forked from `from_branch`.
    pub async fn create_worktree(
        &self,
        path: &Path,
        new_branch: &str,
        from_branch: &str,
    ) -> CoordResult<()> {
        validate_branch_name(new_branch)?;
        validate_branch_name(from_branch)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy();
        info!(path = %path_str, branch = new_branch, from = from_branch, "creating worktree");
        self.git_ok(
            &self.repo_root,
            &["worktree", "add", "-b", new_branch, &path_str, from_branch],
        )
        .await?;
        Ok(())
    }

    /// Stage all changes in the worktree and commit. No-op when clean.
    ///
    /// Returns the commit SHA, or `None` if there was nothing to commit.
    pub async fn commit_worktree(&self, path: &Path, message: &str) -> CoordResult<Option<String>> {
        self.git_ok(path, &["add", "-A"]).await?;

        let status = self.git_ok(path, &["status", "--porcelain"]).await?;
        if status.stdout.trim().is_empty() {
            debug!(path = %path.display(), "worktree clean, nothing to commit");
            return Ok(None);
        }

        self.git_ok(path, &["commit", "-m", message]).await?;
        let sha = self.head_sha(path).await?;
        Ok(Some(sha))
    }

    /// Commit SHA of HEAD in `path`.
    pub async fn head_sha(&self, path: &Path) -> CoordResult<String> {
        let out = self.git_ok(path, &["rev-parse", "HEAD"]).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Files changed on the worktree's branch relative to `base`.
    pub async fn modified_files(&self, path: &Path, base: &str) -> CoordResult<Vec<String>> {
        validate_branch_name(base)?;
        let range = format!("{base}...HEAD");
        let out = self
            .git_ok(path, &["diff", "--name-only", &range])
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Remove a worktree: prune stale entries first, then remove, then
    /// best-effort delete whatever is left of the directory.
    pub async fn remove_worktree(&self, path: &Path) -> CoordResult<()> {
        let _ = self.prune().await;

        let path_str = path.to_string_lossy();
        let out = self
            .run_git(&self.repo_root, &["worktree", "remove", "--force", &path_str])
            .await?;
        if !out.success() {
            warn!(path = %path_str, stderr = %out.stderr_excerpt(), "worktree remove failed");
        }

        if path.exists() {
            if let Err(err) = std::fs::remove_dir_all(path) {
                warn!(path = %path_str, error = %err, "failed to delete worktree directory");
            }
        }
        Ok(())
    }

    /// Prune stale worktree administrative entries.
    pub async fn prune(&self) -> CoordResult<()> {
        self.git_ok(&self.repo_root, &["worktree", "prune"]).await?;
        Ok(())
    }

    /// Delete a branch in the main repository. Best-effort.
    pub async fn delete_branch(&self, branch: &str) -> CoordResult<()> {
        validate_branch_name(branch)?;
        let out = self
            .run_git(&self.repo_root, &["branch", "-D", branch])
            .await?;
        if !out.success() {
            warn!(branch, stderr = %out.stderr_excerpt(), "branch delete failed");
        }
        Ok(())
    }

    /// Files currently unmerged (conflicted) in `dir`.
    pub async fn conflicted_files(&self, dir: &Path) -> CoordResult<Vec<ConflictedFile>> {
        let out = self
            .git_ok(dir, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|rel| ConflictedFile {
                path: rel.to_string(),
                full_path: dir.join(rel),
            })
            .collect())
    }

    /// Stage one file in `dir`.
    pub async fn stage_file(&self, dir: &Path, rel_path: &str) -> CoordResult<()> {
        self.git_ok(dir, &["add", "--", rel_path]).await?;
        Ok(())
    }

    /// Diff of a branch against its merge-base with `base`, for conflict
    /// negotiation context. Returns an empty string on failure; the
    /// negotiation prompt degrades gracefully without it.
    pub async fn branch_diff(&self, dir: &Path, base: &str, branch: &str) -> String {
        if validate_branch_name(base).is_err() || validate_branch_name(branch).is_err() {
            return String::new();
        }
        let range = format!("{base}...{branch}");
        match self.run_git(dir, &["diff", &range]).await {
            Ok(out) if out.success() => out.stdout,
            _ => String::new(),
        }
    }
}

/// Validates a git branch name to prevent flag injection.
///
/// Follows `git check-ref-format` rules closely enough to reject anything
/// that could be interpreted as an option or a revision range.
pub fn validate_branch_name(name: &str) -> CoordResult<()> {
    if name.is_empty() {
        return Err(CoordError::ValidationFailed(
            "branch name cannot be empty".to_string(),
        ));
    }
    if name.starts_with('-') {
        return Err(CoordError::ValidationFailed(format!(
            "invalid branch name '{name}': must not start with '-'"
        )));
    }
    if name.contains("..") {
        return Err(CoordError::ValidationFailed(format!(
            "invalid branch name '{name}': must not contain '..'"
        )));
    }
    for ch in name.chars() {
        if ch.is_ascii_control() || matches!(ch, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\') {
            return Err(CoordError::ValidationFailed(format!(
                "invalid branch name '{name}': contains disallowed character '{ch}'"
            )));
        }
    }
    if name.ends_with(".lock") {
        return Err(CoordError::ValidationFailed(format!(
            "invalid branch name '{name}': must not end with '.lock'"
        )));
    }
    Ok(())
}
