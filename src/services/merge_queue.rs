//! Incremental merge queue.
//!
//! Completed tasks enqueue a merge job for their agent branch. Jobs
//! dequeue in completion order, gated on every dependency already being
//! merged, and execute one at a time. Conflicts are handed to the
//! negotiator with both sides' task intents; a failed job is terminal for
//! that task but never blocks independent merges.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::models::{MergeState, MergeStrategy, Task, TaskStatus};
use crate::domain::{CoordError, CoordResult};
use crate::infrastructure::git::WorktreeManager;
use crate::services::conflict::{ConflictNegotiator, TaskIntent};
use crate::services::events::{EventBus, TeamEvent};
use crate::services::task_store::TaskStore;

/// A queued request to merge an agent branch into the target branch.
#[derive(Debug, Clone)]
pub struct MergeJob {
    pub task_id: String,
    pub agent_id: String,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub target_branch: String,
}

/// Result of processing one job.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub task_id: String,
    pub merged: bool,
    pub commit_sha: Option<String>,
    pub error: Option<String>,
}

/// Warning that two or more pending tasks expect to touch the same file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapWarning {
    pub file: String,
    pub task_ids: Vec<String>,
}

/// The merge pipeline.
pub struct MergeManager {
    git: Arc<WorktreeManager>,
    store: Arc<TaskStore>,
    events: EventBus,
    strategy: MergeStrategy,
    negotiator: Option<Arc<ConflictNegotiator>>,
    queue: Mutex<VecDeque<MergeJob>>,
}

impl MergeManager {
    pub fn new(
        git: Arc<WorktreeManager>,
        store: Arc<TaskStore>,
        events: EventBus,
        strategy: MergeStrategy,
        negotiator: Option<Arc<ConflictNegotiator>>,
    ) -> Self {
        Self {
            git,
            store,
            events,
            strategy,
            negotiator,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Files listed by two or more non-terminal tasks.
    pub fn detect_file_overlap(tasks: &[Task]) -> Vec<OverlapWarning> {
        let mut by_file: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in tasks.iter().filter(|t| !t.is_terminal()) {
            for file in &task.files {
                by_file.entry(file.as_str()).or_default().push(&task.id);
            }
        }
        let mut warnings: Vec<OverlapWarning> = by_file
            .into_iter()
            .filter(|(_, ids)| ids.len() >= 2)
            .map(|(file, ids)| OverlapWarning {
                file: file.to_string(),
                task_ids: ids.into_iter().map(String::from).collect(),
            })
            .collect();
        warnings.sort_by(|a, b| a.file.cmp(&b.file));
        warnings
    }

    /// Enqueue a completed task's branch for merging.
    pub async fn queue_for_merge(&self, job: MergeJob) -> CoordResult<()> {
        let _ = self
            .store
            .set_merge_state(&job.task_id, MergeState::Queued)
            .await;
        info!(task_id = %job.task_id, branch = %job.branch, "queued for merge");
        self.queue.lock().await.push_back(job);
        Ok(())
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Process the next dependency-ready job, if any.
    ///
    /// Jobs whose task dependencies are not all merged are skipped and
    /// stay queued. Merges run one at a time; the caller drives this from
    /// a single loop.
    pub async fn process_next(&self, cancel: &CancellationToken) -> CoordResult<Option<MergeOutcome>> {
        let Some(job) = self.pop_ready().await else {
            return Ok(None);
        };

        let _ = self
            .store
            .set_merge_state(&job.task_id, MergeState::Merging)
            .await;

        let outcome = match self.execute(&job, cancel).await {
            Ok(commit_sha) => {
                let _ = self
                    .store
                    .set_merge_state(&job.task_id, MergeState::Merged)
                    .await;
                self.events.emit(TeamEvent::MergeCompleted {
                    task_id: job.task_id.clone(),
                    commit_sha: commit_sha.clone(),
                });
                info!(task_id = %job.task_id, commit = %commit_sha, "merge landed");
                MergeOutcome {
                    task_id: job.task_id.clone(),
                    merged: true,
                    commit_sha: Some(commit_sha),
                    error: None,
                }
            }
            Err(err) => {
                // Terminal for this job; independent merges continue.
                let _ = self
                    .store
                    .set_merge_state(&job.task_id, MergeState::Failed)
                    .await;
                self.events.emit(TeamEvent::MergeFailed {
                    task_id: job.task_id.clone(),
                    reason: err.to_string(),
                });
                warn!(task_id = %job.task_id, error = %err, "merge failed");
                MergeOutcome {
                    task_id: job.task_id.clone(),
                    merged: false,
                    commit_sha: None,
                    error: Some(err.to_string()),
                }
            }
        };
        Ok(Some(outcome))
    }

    /// Remove and return the first job whose dependencies are all merged.
    async fn pop_ready(&self) -> Option<MergeJob> {
        let mut queue = self.queue.lock().await;
        let mut ready_index = None;
        for (i, job) in queue.iter().enumerate() {
            if self.dependencies_merged(&job.task_id).await {
                ready_index = Some(i);
                break;
            }
        }
        ready_index.and_then(|i| queue.remove(i))
    }

    async fn dependencies_merged(&self, task_id: &str) -> bool {
        let Some(task) = self.store.get_by_id(task_id).await else {
            return false;
        };
        for dep in &task.depends_on {
            match self.store.get_by_id(dep).await {
                Some(dep_task) if dep_task.merge_state == MergeState::Merged => {}
                _ => return false,
            }
        }
        true
    }

    async fn execute(&self, job: &MergeJob, cancel: &CancellationToken) -> CoordResult<String> {
        match self.strategy {
            MergeStrategy::MergeDirect => self.merge_into_target(job, false, cancel).await,
            MergeStrategy::RebaseThenMerge | MergeStrategy::Sequential => {
                self.rebase_then_merge(job, cancel).await
            }
        }
    }

    /// Default strategy: rebase the agent branch onto the target inside
    /// the worktree, then land it with `merge --no-ff` and delete the
    /// branch.
    async fn rebase_then_merge(&self, job: &MergeJob, cancel: &CancellationToken) -> CoordResult<String> {
        let rebase = self
            .git
            .run_git(&job.worktree_path, &["rebase", &job.target_branch])
            .await?;
        if !rebase.success() {
            if let Err(err) = self
                .resolve_in_dir(job, &job.worktree_path.clone(), RecoveryMode::Rebase, cancel)
                .await
            {
                // A half-done rebase would wedge the worktree.
                let _ = self
                    .git
                    .run_git(&job.worktree_path, &["rebase", "--abort"])
                    .await;
                return Err(err);
            }
        }

        let sha = self.merge_into_target(job, true, cancel).await?;
        self.git.delete_branch(&job.branch).await?;
        Ok(sha)
    }

    /// Merge the agent branch into the target branch in the main checkout.
    async fn merge_into_target(
        &self,
        job: &MergeJob,
        no_ff: bool,
        cancel: &CancellationToken,
    ) -> CoordResult<String> {
        let repo = self.git.repo_root().to_path_buf();

        let checkout = self
            .git
            .run_git(&repo, &["checkout", &job.target_branch])
            .await?;
        if !checkout.success() {
            return Err(CoordError::Git(format!(
                "checkout {} failed: {}",
                job.target_branch,
                checkout.stderr_excerpt()
            )));
        }

        let message = format!("Merge {} ({})", job.branch, job.task_id);
        let mut args = vec!["merge"];
        if no_ff {
            args.push("--no-ff");
        }
        args.extend(["-m", &message, "--", &job.branch]);

        let merge = self.git.run_git(&repo, &args).await?;
        if !merge.success() {
            let recovered = self
                .resolve_in_dir(job, &repo, RecoveryMode::Merge, cancel)
                .await;
            if let Err(err) = recovered {
                let _ = self.git.run_git(&repo, &["merge", "--abort"]).await;
                return Err(err);
            }
        }

        self.git.head_sha(&repo).await
    }

    /// Detect conflicts in `dir`, negotiate, apply, and finish the
    /// interrupted rebase or merge.
    async fn resolve_in_dir(
        &self,
        job: &MergeJob,
        dir: &PathBuf,
        mode: RecoveryMode,
        cancel: &CancellationToken,
    ) -> CoordResult<()> {
        let conflicts = self.git.conflicted_files(dir).await?;
        if conflicts.is_empty() {
            return Err(CoordError::Git(format!(
                "{} failed without unmerged files in {}",
                mode.verb(),
                dir.display()
            )));
        }

        let _ = self
            .store
            .set_merge_state(&job.task_id, MergeState::ConflictDetected)
            .await;

        let Some(negotiator) = &self.negotiator else {
            return Err(CoordError::ManualInterventionRequired(format!(
                "{} conflicts in {} files and no negotiator configured",
                mode.verb(),
                conflicts.len()
            )));
        };

        let ours = self.intent_for(&job.task_id, &job.agent_id, &job.branch).await;
        let theirs = TaskIntent {
            agent_id: "team".to_string(),
            branch: job.target_branch.clone(),
            description: Some(format!(
                "previously merged work on {}",
                job.target_branch
            )),
        };

        let resolutions = negotiator
            .negotiate(&self.git, dir, &conflicts, &ours, &theirs, cancel)
            .await?;
        negotiator.apply(&self.git, dir, &resolutions).await?;

        let _ = self
            .store
            .set_merge_state(&job.task_id, MergeState::Resolved)
            .await;

        // Retry: finish the interrupted operation.
        let finish = match mode {
            RecoveryMode::Rebase => {
                self.git
                    .run_git(dir, &["-c", "core.editor=true", "rebase", "--continue"])
                    .await?
            }
            RecoveryMode::Merge => self.git.run_git(dir, &["commit", "--no-edit"]).await?,
        };
        if !finish.success() {
            return Err(CoordError::ManualInterventionRequired(format!(
                "{} still conflicted after negotiation: {}",
                mode.verb(),
                finish.stderr_excerpt()
            )));
        }
        Ok(())
    }

    async fn intent_for(&self, task_id: &str, agent_id: &str, branch: &str) -> TaskIntent {
        let description = self
            .store
            .get_by_id(task_id)
            .await
            .map(|t| format!("{}: {}", t.title, t.description));
        TaskIntent {
            agent_id: agent_id.to_string(),
            branch: branch.to_string(),
            description,
        }
    }

    /// True when every completed task has left the pipeline (merged or
    /// terminally failed) and nothing is queued.
    pub async fn drained(&self) -> bool {
        if self.queue_len().await > 0 {
            return false;
        }
        let completed = self.store.get_by_status(TaskStatus::Completed).await;
        completed
            .iter()
            .all(|t| matches!(t.merge_state, MergeState::Merged | MergeState::Failed))
    }
}

#[derive(Debug, Clone, Copy)]
enum RecoveryMode {
    Rebase,
    Merge,
}

impl RecoveryMode {
    fn verb(self) -> &'static str {
        match self {
            Self::Rebase => "rebase",
            Self::Merge => "merge",
        }
    }
}
