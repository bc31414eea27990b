//! Durable, file-locked task store with dependency-aware claiming.
//!
//! All mutations take the exclusive claims lock, reload the task file to
//! pick up writes from sibling processes, apply the change, and persist
//! atomically (write temp file, rename). Readers never lock.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::models::{Task, TaskResult, TaskStatistics, TaskStatus};
use crate::domain::{CoordError, CoordResult};
use crate::infrastructure::fs_lock::FileLock;
use crate::services::events::{EventBus, TeamEvent};

/// Interval between lock acquisition attempts.
const LOCK_RETRY: Duration = Duration::from_millis(10);

/// Tunables for the store.
#[derive(Debug, Clone)]
pub struct TaskStoreConfig {
    /// Claims older than this revert to Pending (claimant presumed dead).
    pub stale_claim_timeout: Duration,
    /// How long a mutation waits for the claims lock before `StoreBusy`.
    pub lock_timeout: Duration,
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            stale_claim_timeout: Duration::from_secs(300),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// The shared task store.
pub struct TaskStore {
    tasks_file: PathBuf,
    lock_path: PathBuf,
    config: TaskStoreConfig,
    events: EventBus,
    tasks: Mutex<Vec<Task>>,
    /// Dependency IDs already reported as unknown, to log once each.
    flagged_unknown_deps: Mutex<HashSet<String>>,
}

impl TaskStore {
    /// Open (or create) the store backed by `tasks_file` and `lock_path`.
    ///
    /// An existing file is loaded; tasks stuck InProgress from a previous
    /// run revert to Pending with the claimant cleared. A corrupt file is
    /// logged and the store starts empty.
    pub fn open(
        tasks_file: impl Into<PathBuf>,
        lock_path: impl Into<PathBuf>,
        config: TaskStoreConfig,
        events: EventBus,
    ) -> Self {
        let tasks_file = tasks_file.into();
        let tasks = load_tasks(&tasks_file);
        Self {
            tasks_file,
            lock_path: lock_path.into(),
            config,
            events,
            tasks: Mutex::new(tasks),
            flagged_unknown_deps: Mutex::new(HashSet::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Acquire the claims lock, retrying without blocking the executor.
    async fn lock(&self) -> CoordResult<FileLock> {
        let started = Instant::now();
        loop {
            if let Some(lock) = FileLock::try_acquire(&self.lock_path)? {
                return Ok(lock);
            }
            if started.elapsed() >= self.config.lock_timeout {
                return Err(CoordError::StoreBusy(format!(
                    "claims lock {} held for over {:?}",
                    self.lock_path.display(),
                    self.config.lock_timeout
                )));
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }
    }

    /// Add a batch of tasks, assigning sequential IDs where missing.
    ///
    /// Dependency cycles within the combined task graph are rejected;
    /// returns the IDs assigned to the batch in order.
    pub async fn add_tasks(&self, mut batch: Vec<Task>) -> CoordResult<Vec<String>> {
        let _lock = self.lock().await?;
        let mut tasks = self.tasks.lock().await;
        reload_under_lock(&self.tasks_file, &mut tasks);

        let mut next = next_task_number(&tasks);
        for task in &mut batch {
            if task.id.is_empty() {
                task.id = format!("task-{next}");
                next += 1;
            }
        }

        // Validate uniqueness against existing tasks.
        for task in &batch {
            if tasks.iter().any(|t| t.id == task.id) {
                return Err(CoordError::ValidationFailed(format!(
                    "duplicate task id: {}",
                    task.id
                )));
            }
        }

        let combined: Vec<&Task> = tasks.iter().chain(batch.iter()).collect();
        if let Some(cycle_id) = find_cycle(&combined) {
            return Err(CoordError::DependencyCycle(cycle_id));
        }

        let ids: Vec<String> = batch.iter().map(|t| t.id.clone()).collect();
        tasks.extend(batch);
        persist(&self.tasks_file, &tasks);

        for id in &ids {
            self.events.emit(TeamEvent::TaskAdded {
                task_id: id.clone(),
            });
        }
        info!(count = ids.len(), "tasks added");
        Ok(ids)
    }

    /// Claim the highest-priority claimable task for `agent_id`.
    ///
    /// Stale claims are released first. Contention is not an error: when
    /// nothing is claimable the call returns `None`.
    pub async fn try_claim(&self, agent_id: &str) -> CoordResult<Option<Task>> {
        let _lock = self.lock().await?;
        let mut tasks = self.tasks.lock().await;
        reload_under_lock(&self.tasks_file, &mut tasks);

        self.release_stale_locked(&mut tasks);

        let Some(index) = self.pick_claimable(&tasks).await else {
            persist(&self.tasks_file, &tasks);
            return Ok(None);
        };

        let task = &mut tasks[index];
        task.status = TaskStatus::InProgress;
        task.claimed_by = Some(agent_id.to_string());
        task.claimed_at = Some(Utc::now());
        let claimed = task.clone();

        persist(&self.tasks_file, &tasks);
        self.events.emit(TeamEvent::TaskClaimed {
            task_id: claimed.id.clone(),
            agent_id: agent_id.to_string(),
        });
        debug!(task_id = %claimed.id, agent_id, "task claimed");
        Ok(Some(claimed))
    }

    /// Claim one specific task for `agent_id`, if it is claimable.
    pub async fn try_claim_specific(
        &self,
        task_id: &str,
        agent_id: &str,
    ) -> CoordResult<Option<Task>> {
        let _lock = self.lock().await?;
        let mut tasks = self.tasks.lock().await;
        reload_under_lock(&self.tasks_file, &mut tasks);

        self.release_stale_locked(&mut tasks);

        let claimable = {
            let Some(task) = tasks.iter().find(|t| t.id == task_id) else {
                return Ok(None);
            };
            is_claimable(task, &tasks)
        };
        if !claimable {
            persist(&self.tasks_file, &tasks);
            return Ok(None);
        }

        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .expect("checked above");
        task.status = TaskStatus::InProgress;
        task.claimed_by = Some(agent_id.to_string());
        task.claimed_at = Some(Utc::now());
        let claimed = task.clone();

        persist(&self.tasks_file, &tasks);
        self.events.emit(TeamEvent::TaskClaimed {
            task_id: claimed.id.clone(),
            agent_id: agent_id.to_string(),
        });
        Ok(Some(claimed))
    }

    /// Record a successful completion.
    ///
    /// Emits `TaskCompleted`, then `TaskUnblocked` for every dependent that
    /// became claimable through this completion.
    pub async fn complete(&self, task_id: &str, result: TaskResult) -> CoordResult<()> {
        let _lock = self.lock().await?;
        let mut tasks = self.tasks.lock().await;
        reload_under_lock(&self.tasks_file, &mut tasks);

        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| CoordError::TaskNotFound(task_id.to_string()))?;
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.error = None;

        persist(&self.tasks_file, &tasks);
        self.events.emit(TeamEvent::TaskCompleted {
            task_id: task_id.to_string(),
        });

        let unblocked: Vec<String> = tasks
            .iter()
            .filter(|t| t.depends_on.iter().any(|d| d == task_id))
            .filter(|t| is_claimable(t, &tasks))
            .map(|t| t.id.clone())
            .collect();
        for id in unblocked {
            debug!(task_id = %id, completed = task_id, "task unblocked");
            self.events.emit(TeamEvent::TaskUnblocked { task_id: id });
        }
        info!(task_id, "task completed");
        Ok(())
    }

    /// Record a failure; re-queues while retries remain, otherwise terminal.
    pub async fn fail(&self, task_id: &str, error: &str) -> CoordResult<()> {
        let _lock = self.lock().await?;
        let mut tasks = self.tasks.lock().await;
        reload_under_lock(&self.tasks_file, &mut tasks);

        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| CoordError::TaskNotFound(task_id.to_string()))?;

        task.retry_count += 1;
        task.error = Some(error.to_string());
        let terminal = task.retry_count > task.max_retries;
        if terminal {
            task.status = TaskStatus::Failed;
            task.claimed_by = None;
            task.claimed_at = None;
        } else {
            task.release_claim();
        }
        let retry_count = task.retry_count;

        persist(&self.tasks_file, &tasks);
        if terminal {
            warn!(task_id, retry_count, error, "task failed terminally");
            self.events.emit(TeamEvent::TaskFailed {
                task_id: task_id.to_string(),
                error: error.to_string(),
            });
        } else {
            info!(task_id, retry_count, error, "task failed, re-queued");
        }
        Ok(())
    }

    /// Revert any claim older than the stale timeout.
    pub async fn release_stale_claims(&self) -> CoordResult<usize> {
        let _lock = self.lock().await?;
        let mut tasks = self.tasks.lock().await;
        reload_under_lock(&self.tasks_file, &mut tasks);
        let released = self.release_stale_locked(&mut tasks);
        persist(&self.tasks_file, &tasks);
        Ok(released)
    }

    /// Refresh a live claim's timestamp (claim heartbeat).
    ///
    /// Long provider calls refresh their claim through this so the stale
    /// timeout measures silence rather than call duration.
    pub async fn refresh_claim(&self, task_id: &str, agent_id: &str) -> CoordResult<()> {
        let _lock = self.lock().await?;
        let mut tasks = self.tasks.lock().await;
        reload_under_lock(&self.tasks_file, &mut tasks);

        if let Some(task) = tasks.iter_mut().find(|t| {
            t.id == task_id
                && t.status == TaskStatus::InProgress
                && t.claimed_by.as_deref() == Some(agent_id)
        }) {
            task.claimed_at = Some(Utc::now());
            persist(&self.tasks_file, &tasks);
        }
        Ok(())
    }

    /// Voluntarily release a claim without charging a retry.
    ///
    /// Used when an agent gives a task back (e.g. its plan was rejected);
    /// only the current claimant may release.
    pub async fn release_claim(&self, task_id: &str, agent_id: &str) -> CoordResult<()> {
        let _lock = self.lock().await?;
        let mut tasks = self.tasks.lock().await;
        reload_under_lock(&self.tasks_file, &mut tasks);

        if let Some(task) = tasks.iter_mut().find(|t| {
            t.id == task_id
                && t.status == TaskStatus::InProgress
                && t.claimed_by.as_deref() == Some(agent_id)
        }) {
            task.release_claim();
            persist(&self.tasks_file, &tasks);
            info!(task_id, agent_id, "claim released");
        }
        Ok(())
    }

    /// Record merge pipeline progress for a completed task.
    pub async fn set_merge_state(
        &self,
        task_id: &str,
        state: crate::domain::models::MergeState,
    ) -> CoordResult<()> {
        let _lock = self.lock().await?;
        let mut tasks = self.tasks.lock().await;
        reload_under_lock(&self.tasks_file, &mut tasks);

        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| CoordError::TaskNotFound(task_id.to_string()))?;
        task.merge_state = state;
        persist(&self.tasks_file, &tasks);
        Ok(())
    }

    fn release_stale_locked(&self, tasks: &mut [Task]) -> usize {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.stale_claim_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
        let mut released = 0;
        for task in tasks.iter_mut() {
            if task.status == TaskStatus::InProgress {
                if let Some(claimed_at) = task.claimed_at {
                    if claimed_at < cutoff {
                        warn!(
                            task_id = %task.id,
                            claimed_by = ?task.claimed_by,
                            "releasing stale claim"
                        );
                        task.release_claim();
                        released += 1;
                    }
                }
            }
        }
        released
    }

    /// Index of the best claimable task: urgent bucket (Critical/High)
    /// before the normal bucket, highest priority first, insertion order as
    /// the tie-break.
    async fn pick_claimable(&self, tasks: &[Task]) -> Option<usize> {
        self.flag_unknown_deps(tasks).await;

        let pick_in = |urgent: bool| -> Option<usize> {
            let mut best: Option<usize> = None;
            for (i, task) in tasks.iter().enumerate() {
                if task.priority.is_urgent() != urgent || !is_claimable(task, tasks) {
                    continue;
                }
                best = match best {
                    Some(b) if tasks[b].priority >= task.priority => Some(b),
                    _ => Some(i),
                };
            }
            best
        };

        pick_in(true).or_else(|| pick_in(false))
    }

    /// Log (once per ID) dependencies that reference no known task. Such
    /// tasks are permanently unclaimable but do not block the store.
    async fn flag_unknown_deps(&self, tasks: &[Task]) {
        let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        let mut flagged = self.flagged_unknown_deps.lock().await;
        for task in tasks {
            for dep in &task.depends_on {
                if !known.contains(dep.as_str()) && flagged.insert(dep.clone()) {
                    warn!(
                        task_id = %task.id,
                        missing_dep = %dep,
                        "task depends on an unknown ID and will never be claimable"
                    );
                }
            }
        }
    }

    // Queries (no lock; in-memory snapshot).

    pub async fn get_all(&self) -> Vec<Task> {
        self.tasks.lock().await.clone()
    }

    pub async fn get_by_id(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().await.iter().find(|t| t.id == task_id).cloned()
    }

    pub async fn get_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    pub async fn get_claimable(&self) -> Vec<Task> {
        let tasks = self.tasks.lock().await;
        tasks
            .iter()
            .filter(|t| is_claimable(t, &tasks))
            .cloned()
            .collect()
    }

    /// Tasks directly blocked on `task_id`.
    pub async fn get_blocked_by(&self, task_id: &str) -> Vec<Task> {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|t| t.depends_on.iter().any(|d| d == task_id) && !t.is_terminal())
            .cloned()
            .collect()
    }

    pub async fn statistics(&self) -> TaskStatistics {
        let tasks = self.tasks.lock().await;
        let mut stats = TaskStatistics {
            total: tasks.len(),
            ..TaskStatistics::default()
        };
        for task in tasks.iter() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        if stats.total > 0 {
            stats.completion_percent = stats.completed as f64 * 100.0 / stats.total as f64;
        }
        stats
    }
}

/// A task is claimable iff Pending and every dependency maps to a
/// Completed task. Unknown dependency IDs make it permanently unclaimable.
fn is_claimable(task: &Task, all: &[Task]) -> bool {
    task.status == TaskStatus::Pending
        && task.depends_on.iter().all(|dep| {
            all.iter()
                .any(|t| &t.id == dep && t.status == TaskStatus::Completed)
        })
}

/// Find a dependency cycle, returning one task ID on it.
fn find_cycle(tasks: &[&Task]) -> Option<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InStack,
        Done,
    }

    fn visit(
        id: &str,
        tasks: &[&Task],
        marks: &mut std::collections::HashMap<String, Mark>,
    ) -> Option<String> {
        match marks.get(id).copied().unwrap_or(Mark::Unvisited) {
            Mark::Done => return None,
            Mark::InStack => return Some(id.to_string()),
            Mark::Unvisited => {}
        }
        marks.insert(id.to_string(), Mark::InStack);
        if let Some(task) = tasks.iter().find(|t| t.id == id) {
            for dep in &task.depends_on {
                if let Some(found) = visit(dep, tasks, marks) {
                    return Some(found);
                }
            }
        }
        marks.insert(id.to_string(), Mark::Done);
        None
    }

    let mut marks = std::collections::HashMap::new();
    for task in tasks {
        if let Some(id) = visit(&task.id, tasks, &mut marks) {
            return Some(id);
        }
    }
    None
}

/// Highest `task-N` suffix plus one.
fn next_task_number(tasks: &[Task]) -> usize {
    tasks
        .iter()
        .filter_map(|t| t.id.strip_prefix("task-"))
        .filter_map(|n| n.parse::<usize>().ok())
        .max()
        .map_or(1, |n| n + 1)
}

/// Load the task file, reverting InProgress entries (prior owner crashed).
fn load_tasks(path: &PathBuf) -> Vec<Task> {
    let Ok(json) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<Task>>(&json) {
        Ok(mut tasks) => {
            for task in &mut tasks {
                if task.status == TaskStatus::InProgress {
                    warn!(task_id = %task.id, "reverting in-progress task from previous run");
                    task.release_claim();
                }
            }
            tasks
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "task file corrupt, starting empty");
            Vec::new()
        }
    }
}

/// Refresh the in-memory set from disk while holding the claims lock, so
/// writes from sibling processes are visible before mutating.
fn reload_under_lock(path: &PathBuf, tasks: &mut Vec<Task>) {
    if !path.exists() {
        return;
    }
    match std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|json| serde_json::from_str::<Vec<Task>>(&json).map_err(|e| e.to_string()))
    {
        Ok(fresh) => *tasks = fresh,
        Err(err) => warn!(path = %path.display(), error = %err, "reload failed, keeping in-memory state"),
    }
}

/// Atomic best-effort persistence: pretty JSON, temp file, rename.
fn persist(path: &PathBuf, tasks: &[Task]) {
    let json = match serde_json::to_string_pretty(tasks) {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, "task serialization failed, skipping persist");
            return;
        }
    };
    let Some(dir) = path.parent() else { return };
    if let Err(err) = std::fs::create_dir_all(dir) {
        warn!(error = %err, "cannot create tasks directory");
        return;
    }
    let tmp = dir.join(".tasks.json.tmp");
    if let Err(err) = std::fs::write(&tmp, json) {
        warn!(error = %err, "task file write failed");
        return;
    }
    if let Err(err) = std::fs::rename(&tmp, path) {
        warn!(error = %err, "task file rename failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TaskPriority;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> TaskStore {
        TaskStore::open(
            dir.path().join("tasks/tasks.json"),
            dir.path().join("tasks/claims.lock"),
            TaskStoreConfig::default(),
            EventBus::default(),
        )
    }

    fn task(title: &str) -> Task {
        Task::new(title, format!("{title} description"))
    }

    #[tokio::test]
    async fn test_ids_assigned_sequentially() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let ids = store
            .add_tasks(vec![task("a"), task("b"), task("c")])
            .await
            .unwrap();
        assert_eq!(ids, vec!["task-1", "task-2", "task-3"]);
    }

    #[tokio::test]
    async fn test_dependency_unblocking_chain() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let t1 = task("t1");
        let t2 = task("t2").with_dependencies(vec!["task-1".into()]);
        let t3 = task("t3").with_dependencies(vec!["task-1".into(), "task-2".into()]);
        store.add_tasks(vec![t1, t2, t3]).await.unwrap();

        let claimable: Vec<String> =
            store.get_claimable().await.into_iter().map(|t| t.id).collect();
        assert_eq!(claimable, vec!["task-1"]);

        store.complete("task-1", TaskResult::default()).await.unwrap();
        let claimable: Vec<String> =
            store.get_claimable().await.into_iter().map(|t| t.id).collect();
        assert_eq!(claimable, vec!["task-2"]);

        store.complete("task-2", TaskResult::default()).await.unwrap();
        let claimable: Vec<String> =
            store.get_claimable().await.into_iter().map(|t| t.id).collect();
        assert_eq!(claimable, vec!["task-3"]);
    }

    #[tokio::test]
    async fn test_unblocked_events_fire_only_when_fully_satisfied() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut rx = store.events().subscribe();

        store
            .add_tasks(vec![
                task("t1"),
                task("t2"),
                task("t3").with_dependencies(vec!["task-1".into(), "task-2".into()]),
            ])
            .await
            .unwrap();
        store.complete("task-1", TaskResult::default()).await.unwrap();
        store.complete("task-2", TaskResult::default()).await.unwrap();

        let mut unblocked = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TeamEvent::TaskUnblocked { task_id } = event.event {
                unblocked.push(task_id);
            }
        }
        // Only after task-2 completes does task-3 unblock, exactly once.
        assert_eq!(unblocked, vec!["task-3"]);
    }

    #[tokio::test]
    async fn test_cycle_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut a = task("a");
        a.id = "task-1".into();
        a.depends_on = vec!["task-2".into()];
        let mut b = task("b");
        b.id = "task-2".into();
        b.depends_on = vec!["task-1".into()];

        let err = store.add_tasks(vec![a, b]).await.unwrap_err();
        assert!(matches!(err, CoordError::DependencyCycle(_)));
        assert!(store.get_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_dependency_never_claimed() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .add_tasks(vec![task("a").with_dependencies(vec!["task-99".into()])])
            .await
            .unwrap();

        assert!(store.get_claimable().await.is_empty());
        assert!(store.try_claim("agent-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_priority_order_and_insertion_tiebreak() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .add_tasks(vec![
                task("medium-first"),
                task("high").with_priority(TaskPriority::High),
                task("critical").with_priority(TaskPriority::Critical),
                task("high-2").with_priority(TaskPriority::High),
            ])
            .await
            .unwrap();

        let first = store.try_claim("a").await.unwrap().unwrap();
        assert_eq!(first.title, "critical");
        let second = store.try_claim("a").await.unwrap().unwrap();
        assert_eq!(second.title, "high");
        let third = store.try_claim("a").await.unwrap().unwrap();
        assert_eq!(third.title, "high-2");
        let fourth = store.try_claim("a").await.unwrap().unwrap();
        assert_eq!(fourth.title, "medium-first");
    }

    #[tokio::test]
    async fn test_claim_exclusivity_under_concurrency() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store_in(&dir));
        store.add_tasks(vec![task("only")]).await.unwrap();

        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.try_claim("A").await.unwrap() })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.try_claim("B").await.unwrap() })
        };

        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
        assert!(ra.is_some() ^ rb.is_some(), "exactly one claim must win");

        let winner = ra.or(rb).unwrap();
        let stored = store.get_by_id(&winner.id).await.unwrap();
        assert_eq!(stored.claimed_by, winner.claimed_by);
        assert_eq!(stored.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_stale_claim_released_on_next_claim() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.add_tasks(vec![task("a")]).await.unwrap();

        let claimed = store.try_claim("dead-agent").await.unwrap().unwrap();

        // Backdate the claim well past the 5 minute timeout.
        {
            let mut tasks = store.tasks.lock().await;
            let t = tasks.iter_mut().find(|t| t.id == claimed.id).unwrap();
            t.claimed_at = Some(Utc::now() - ChronoDuration::minutes(10));
            persist(&store.tasks_file, &tasks);
        }

        let reclaimed = store.try_claim("live-agent").await.unwrap().unwrap();
        assert_eq!(reclaimed.id, claimed.id);
        assert_eq!(reclaimed.claimed_by.as_deref(), Some("live-agent"));
    }

    #[tokio::test]
    async fn test_refresh_claim_prevents_stale_release() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.add_tasks(vec![task("a")]).await.unwrap();
        let claimed = store.try_claim("agent-1").await.unwrap().unwrap();

        {
            let mut tasks = store.tasks.lock().await;
            let t = tasks.iter_mut().find(|t| t.id == claimed.id).unwrap();
            t.claimed_at = Some(Utc::now() - ChronoDuration::minutes(10));
            persist(&store.tasks_file, &tasks);
        }
        store.refresh_claim(&claimed.id, "agent-1").await.unwrap();

        assert_eq!(store.release_stale_claims().await.unwrap(), 0);
        let current = store.get_by_id(&claimed.id).await.unwrap();
        assert_eq!(current.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_retry_then_terminal_failure() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut t = task("flaky");
        t.max_retries = 2;
        store.add_tasks(vec![t]).await.unwrap();
        let mut rx = store.events().subscribe();

        store.try_claim("a").await.unwrap().unwrap();
        store.fail("task-1", "boom").await.unwrap();
        let after_first = store.get_by_id("task-1").await.unwrap();
        assert_eq!(after_first.status, TaskStatus::Pending);
        assert_eq!(after_first.retry_count, 1);

        store.try_claim("a").await.unwrap().unwrap();
        store.fail("task-1", "boom").await.unwrap();
        let after_second = store.get_by_id("task-1").await.unwrap();
        assert_eq!(after_second.status, TaskStatus::Pending);
        assert_eq!(after_second.retry_count, 2);

        store.try_claim("a").await.unwrap().unwrap();
        store.fail("task-1", "boom").await.unwrap();
        let after_third = store.get_by_id("task-1").await.unwrap();
        assert_eq!(after_third.status, TaskStatus::Failed);
        assert_eq!(after_third.retry_count, 3);

        let mut saw_failed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.event, TeamEvent::TaskFailed { .. }) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn test_persistence_round_trip_reverts_in_progress() {
        let dir = TempDir::new().unwrap();
        let tasks_file = dir.path().join("tasks/tasks.json");
        let lock_path = dir.path().join("tasks/claims.lock");

        {
            let store = TaskStore::open(
                &tasks_file,
                &lock_path,
                TaskStoreConfig::default(),
                EventBus::default(),
            );
            store
                .add_tasks(vec![task("a"), task("b").with_priority(TaskPriority::High)])
                .await
                .unwrap();
            store.try_claim("agent-1").await.unwrap().unwrap();
        }

        let reopened = TaskStore::open(
            &tasks_file,
            &lock_path,
            TaskStoreConfig::default(),
            EventBus::default(),
        );
        let all = reopened.get_all().await;
        assert_eq!(all.len(), 2);
        // The claim from the previous run is treated as crashed.
        assert!(all.iter().all(|t| t.status == TaskStatus::Pending));
        assert!(all.iter().all(|t| t.claimed_by.is_none()));
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let tasks_file = dir.path().join("tasks/tasks.json");
        std::fs::create_dir_all(tasks_file.parent().unwrap()).unwrap();
        std::fs::write(&tasks_file, "{not json").unwrap();

        let store = TaskStore::open(
            &tasks_file,
            dir.path().join("tasks/claims.lock"),
            TaskStoreConfig::default(),
            EventBus::default(),
        );
        assert!(store.get_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_statistics() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .add_tasks(vec![task("a"), task("b"), task("c"), task("d")])
            .await
            .unwrap();
        store.try_claim("x").await.unwrap().unwrap();
        store.complete("task-1", TaskResult::default()).await.unwrap();
        store.try_claim("x").await.unwrap().unwrap();

        let stats = store.statistics().await;
        assert_eq!(stats.total, 4);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.pending, 2);
        assert!((stats.completion_percent - 25.0).abs() < f64::EPSILON);
        assert!(!stats.all_terminal());
    }

    #[tokio::test]
    async fn test_get_blocked_by() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .add_tasks(vec![
                task("root"),
                task("child").with_dependencies(vec!["task-1".into()]),
            ])
            .await
            .unwrap();
        let blocked = store.get_blocked_by("task-1").await;
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].id, "task-2");
    }
}
