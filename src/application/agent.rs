//! Agent runtime.
//!
//! Each agent runs this loop in its own tokio task: claim work, optionally
//! clear a plan with the lead, execute inside its worktree, report, repeat.
//! The agent reaches the rest of the team only through the task store and
//! its mailbox; it holds no reference back into the orchestrator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::analyzer::ResponseAnalyzer;
use crate::domain::models::{
    AgentRecord, AgentState, Message, MessageType, ProviderConfig, Task, TaskResult, LEAD_ID,
};
use crate::infrastructure::git::WorktreeManager;
use crate::infrastructure::providers::{OutputSink, ProviderInvoker};
use crate::services::events::{EventBus, TeamEvent};
use crate::services::mailbox::MessageBus;
use crate::services::merge_queue::{MergeJob, MergeManager};
use crate::services::task_store::TaskStore;

/// Idle backoff schedule: doubles from 1 s, capped at 30 s.
const IDLE_BACKOFF_START_SECS: u64 = 1;
const IDLE_BACKOFF_CAP_SECS: u64 = 30;

/// How long a PlanningWork agent waits for the lead before giving the task back.
const PLAN_APPROVAL_WAIT: Duration = Duration::from_secs(600);

/// Maximum plan rejections before the task is released.
const MAX_PLAN_REVISIONS: u32 = 3;

/// Everything an agent needs to run, wired by the orchestrator.
pub struct AgentHarness {
    pub record: Arc<Mutex<AgentRecord>>,
    pub store: Arc<TaskStore>,
    pub bus: Arc<MessageBus>,
    pub git: Arc<WorktreeManager>,
    pub invoker: Arc<ProviderInvoker>,
    pub merge: Arc<MergeManager>,
    pub events: EventBus,
    pub provider: ProviderConfig,
    /// Project-wide system context folded into every prompt.
    pub system_context: String,
    pub target_branch: String,
    pub cancel: CancellationToken,
}

/// Mutable per-loop bookkeeping.
#[derive(Default)]
struct LoopState {
    /// Inbox Text bodies queued for the next task prompt.
    pending_context: Vec<String>,
    /// Task ID requested via TaskAssignment, tried on the next tick.
    requested_task: Option<String>,
    /// Shutdown accepted; stop as soon as the current activity ends.
    shutdown: bool,
    backoff_secs: u64,
    notified_all_resolved: bool,
}

/// The agent state machine.
pub struct AgentRuntime {
    harness: AgentHarness,
    agent_id: String,
    model: String,
    worktree_path: PathBuf,
    analyzer: ResponseAnalyzer,
}

impl AgentRuntime {
    pub async fn new(harness: AgentHarness) -> Self {
        let (agent_id, model, worktree_path) = {
            let record = harness.record.lock().await;
            (
                record.agent_id.clone(),
                record.model.model.clone(),
                PathBuf::from(&record.worktree_path),
            )
        };
        Self {
            harness,
            agent_id,
            model,
            worktree_path,
            analyzer: ResponseAnalyzer::new(),
        }
    }

    /// Run until shutdown, cancellation, or an unrecoverable error.
    pub async fn run(mut self) {
        if let Err(err) = self.harness.bus.ensure_mailbox().await {
            warn!(agent_id = %self.agent_id, error = %err, "mailbox creation failed");
            self.set_state(AgentState::Error).await;
            return;
        }
        self.set_state(AgentState::Ready).await;
        info!(agent_id = %self.agent_id, model = %self.model, "agent ready");

        let mut state = LoopState {
            backoff_secs: IDLE_BACKOFF_START_SECS,
            ..LoopState::default()
        };

        while !self.harness.cancel.is_cancelled() {
            match self.harness.bus.poll().await {
                Ok(messages) => self.handle_messages(messages, &mut state).await,
                Err(err) => warn!(agent_id = %self.agent_id, error = %err, "inbox poll failed"),
            }
            if state.shutdown {
                break;
            }

            self.set_state(AgentState::Claiming).await;
            let claimed = self.claim_next(&mut state).await;

            match claimed {
                Some(task) => {
                    state.backoff_secs = IDLE_BACKOFF_START_SECS;
                    state.notified_all_resolved = false;
                    self.harness.record.lock().await.current_task_id = Some(task.id.clone());

                    // A shutdown request may have landed while we were
                    // claiming; defer it past the task we now hold.
                    if let Ok(messages) = self.harness.bus.poll().await {
                        self.handle_messages(messages, &mut state).await;
                    }

                    let approved = if self.requires_plan_approval().await {
                        self.plan_phase(&task, &mut state).await
                    } else {
                        true
                    };
                    if approved {
                        self.work_on(&task, &mut state).await;
                    } else {
                        self.harness.record.lock().await.current_task_id = None;
                    }
                    if state.shutdown {
                        break;
                    }
                }
                None => {
                    self.maybe_notify_all_resolved(&mut state).await;
                    self.set_state(AgentState::Idle).await;
                    self.idle_wait(&mut state).await;
                    if state.shutdown {
                        break;
                    }
                }
            }
        }

        self.set_state(AgentState::ShuttingDown).await;
        self.release_current_task().await;
        self.set_state(AgentState::Stopped).await;
        info!(agent_id = %self.agent_id, "agent stopped");
    }

    async fn set_state(&self, new_state: AgentState) {
        let mut record = self.harness.record.lock().await;
        record.enter_state(new_state);
        self.harness.events.emit(TeamEvent::AgentStateChanged {
            agent_id: self.agent_id.clone(),
            state: new_state,
        });
    }

    async fn requires_plan_approval(&self) -> bool {
        self.harness.record.lock().await.require_plan_approval
    }

    async fn claim_next(&self, state: &mut LoopState) -> Option<Task> {
        if let Some(task_id) = state.requested_task.take() {
            match self
                .harness
                .store
                .try_claim_specific(&task_id, &self.agent_id)
                .await
            {
                Ok(Some(task)) => return Some(task),
                Ok(None) => {
                    debug!(agent_id = %self.agent_id, task_id, "assigned task not claimable")
                }
                Err(err) => warn!(agent_id = %self.agent_id, error = %err, "specific claim failed"),
            }
        }
        match self.harness.store.try_claim(&self.agent_id).await {
            Ok(task) => task,
            Err(err) => {
                // Lock contention is transient; try again next tick.
                debug!(agent_id = %self.agent_id, error = %err, "claim attempt failed");
                None
            }
        }
    }

    async fn handle_messages(&self, messages: Vec<Message>, state: &mut LoopState) {
        for message in messages {
            match message.message_type {
                MessageType::Text | MessageType::Broadcast => {
                    state
                        .pending_context
                        .push(format!("{}: {}", message.from_agent_id, message.content));
                }
                MessageType::TaskAssignment => {
                    if let Some(task_id) = message.meta("taskId") {
                        state.requested_task = Some(task_id.to_string());
                    }
                }
                MessageType::ShutdownRequest => {
                    let working = {
                        let record = self.harness.record.lock().await;
                        record.state == AgentState::Working || record.current_task_id.is_some()
                    };
                    if working {
                        // Deferred: finish the current task first.
                        let _ = self
                            .harness
                            .bus
                            .send(
                                &message.from_agent_id,
                                MessageType::ShutdownResponse,
                                "task in progress; stopping after it completes",
                                vec![("accepted".to_string(), "false".to_string())],
                            )
                            .await;
                    } else {
                        let _ = self
                            .harness
                            .bus
                            .send(
                                &message.from_agent_id,
                                MessageType::ShutdownResponse,
                                "shutting down",
                                vec![("accepted".to_string(), "true".to_string())],
                            )
                            .await;
                    }
                    state.shutdown = true;
                }
                MessageType::StatusUpdate
                | MessageType::ShutdownResponse
                | MessageType::PlanSubmission
                | MessageType::PlanApproval => {
                    debug!(
                        agent_id = %self.agent_id,
                        message_type = message.message_type.as_str(),
                        "ignoring message type not handled by workers"
                    );
                }
            }
        }
    }

    async fn maybe_notify_all_resolved(&self, state: &mut LoopState) {
        if state.notified_all_resolved {
            return;
        }
        let stats = self.harness.store.statistics().await;
        if stats.total > 0 && stats.all_terminal() {
            let _ = self
                .harness
                .bus
                .send(
                    LEAD_ID,
                    MessageType::StatusUpdate,
                    "all tasks resolved; standing by",
                    vec![("allResolved".to_string(), "true".to_string())],
                )
                .await;
            state.notified_all_resolved = true;
        }
    }

    /// Idle backoff: sleep, but wake immediately on a task-unblocked event
    /// or any inbox message.
    async fn idle_wait(&self, state: &mut LoopState) {
        let mut events = self.harness.events.subscribe();
        let backoff = Duration::from_secs(state.backoff_secs);

        tokio::select! {
            messages = self.harness.bus.wait_for_messages(backoff, &self.harness.cancel) => {
                if let Ok(messages) = messages {
                    self.handle_messages(messages, state).await;
                }
            }
            event = events.recv() => {
                if let Ok(event) = event {
                    if matches!(event.event, TeamEvent::TaskUnblocked { .. }) {
                        debug!(agent_id = %self.agent_id, "woken by unblocked task");
                        state.backoff_secs = IDLE_BACKOFF_START_SECS;
                        return;
                    }
                }
            }
            () = self.harness.cancel.cancelled() => {}
        }

        state.backoff_secs = (state.backoff_secs * 2).min(IDLE_BACKOFF_CAP_SECS);
    }

    /// Submit a plan and wait for the lead's approval, revising up to
    /// [`MAX_PLAN_REVISIONS`] times. Returns false (and releases the
    /// claim) when the plan never clears.
    async fn plan_phase(&self, task: &Task, state: &mut LoopState) -> bool {
        self.set_state(AgentState::PlanningWork).await;
        let mut feedback: Option<String> = None;

        for rejection_count in 0..MAX_PLAN_REVISIONS {
            let plan = match self.draft_plan(task, feedback.as_deref()).await {
                Some(plan) => plan,
                None => {
                    warn!(agent_id = %self.agent_id, task_id = %task.id, "plan drafting failed");
                    break;
                }
            };

            let _ = self
                .harness
                .bus
                .send(
                    LEAD_ID,
                    MessageType::PlanSubmission,
                    plan,
                    vec![("taskId".to_string(), task.id.clone())],
                )
                .await;

            let approval = self
                .harness
                .bus
                .wait_for_message_of_type(
                    MessageType::PlanApproval,
                    PLAN_APPROVAL_WAIT,
                    &self.harness.cancel,
                )
                .await
                .ok()
                .flatten();

            match approval {
                Some(message) if message.meta_flag("approved") => {
                    info!(agent_id = %self.agent_id, task_id = %task.id, "plan approved");
                    return true;
                }
                Some(message) => {
                    info!(
                        agent_id = %self.agent_id,
                        task_id = %task.id,
                        rejection = rejection_count + 1,
                        "plan rejected"
                    );
                    feedback = Some(message.content);
                }
                None => {
                    warn!(agent_id = %self.agent_id, task_id = %task.id, "no plan approval arrived");
                    break;
                }
            }
        }

        let _ = self
            .harness
            .store
            .release_claim(&task.id, &self.agent_id)
            .await;
        false
    }

    async fn draft_plan(&self, task: &Task, feedback: Option<&str>) -> Option<String> {
        let mut prompt = format!(
            "Propose a short implementation plan for this task. Do not edit any files.\n\n\
             Task: {}\n{}\n",
            task.title, task.description
        );
        if let Some(feedback) = feedback {
            prompt.push_str(&format!(
                "\nYour previous plan was rejected with this feedback; revise it:\n{feedback}\n"
            ));
        }
        let result = self
            .harness
            .invoker
            .invoke(
                &self.harness.provider.to_analysis(),
                &self.model,
                &prompt,
                &self.worktree_path,
                None,
                &self.harness.cancel,
            )
            .await
            .ok()?;
        result.success.then_some(result.parsed_text)
    }

    /// Execute one claimed task inside the worktree and report the result.
    async fn work_on(&mut self, task: &Task, state: &mut LoopState) {
        self.set_state(AgentState::Working).await;
        {
            let mut record = self.harness.record.lock().await;
            record.current_task_id = Some(task.id.clone());
        }

        let prompt = self.build_prompt(task, &state.pending_context).await;
        state.pending_context.clear();

        let (sink, heartbeat_task) = self.claim_refresh_sink(&task.id);
        let started = Instant::now();
        let invocation = self
            .harness
            .invoker
            .invoke(
                &self.harness.provider,
                &self.model,
                &prompt,
                &self.worktree_path,
                Some(sink),
                &self.harness.cancel,
            )
            .await;
        heartbeat_task.abort();
        let duration_ms = started.elapsed().as_millis() as u64;

        match invocation {
            Ok(result) if result.success => {
                let verdict = self.analyzer.observe(&result.parsed_text);
                self.finish_success(task, duration_ms, verdict.should_exit)
                    .await;
            }
            Ok(result) => {
                let error = result
                    .error
                    .unwrap_or_else(|| "provider failed without detail".to_string());
                self.finish_failure(task, &error).await;
            }
            Err(err) => self.finish_failure(task, &err.to_string()).await,
        }

        {
            let mut record = self.harness.record.lock().await;
            record.current_task_id = None;
        }
    }

    async fn finish_success(&self, task: &Task, duration_ms: u64, completion_signal: bool) {
        let commit_message = format!("{}: {}", self.agent_id, task.title);
        let commit_sha = match self
            .harness
            .git
            .commit_worktree(&self.worktree_path, &commit_message)
            .await
        {
            Ok(sha) => sha,
            Err(err) => {
                self.finish_failure(task, &format!("commit failed: {err}")).await;
                return;
            }
        };
        let modified_files = self
            .harness
            .git
            .modified_files(&self.worktree_path, &self.harness.target_branch)
            .await
            .unwrap_or_default();

        let result = TaskResult {
            commit_sha: commit_sha.clone(),
            modified_files,
            duration_ms,
        };
        if let Err(err) = self.harness.store.complete(&task.id, result).await {
            warn!(agent_id = %self.agent_id, task_id = %task.id, error = %err, "complete failed");
            return;
        }

        let branch = self.harness.record.lock().await.branch.clone();
        let _ = self
            .harness
            .merge
            .queue_for_merge(MergeJob {
                task_id: task.id.clone(),
                agent_id: self.agent_id.clone(),
                worktree_path: self.worktree_path.clone(),
                branch,
                target_branch: self.harness.target_branch.clone(),
            })
            .await;

        {
            let mut record = self.harness.record.lock().await;
            record.stats.tasks_completed += 1;
        }

        let mut metadata = vec![("taskId".to_string(), task.id.clone())];
        if completion_signal {
            metadata.push(("completionSignal".to_string(), "true".to_string()));
        }
        let _ = self
            .harness
            .bus
            .send(
                LEAD_ID,
                MessageType::StatusUpdate,
                format!("completed {} ({})", task.id, task.title),
                metadata,
            )
            .await;
        info!(agent_id = %self.agent_id, task_id = %task.id, "task completed");
    }

    async fn finish_failure(&self, task: &Task, error: &str) {
        warn!(agent_id = %self.agent_id, task_id = %task.id, error, "task failed");
        let _ = self.harness.store.fail(&task.id, error).await;
        {
            let mut record = self.harness.record.lock().await;
            record.stats.tasks_failed += 1;
        }
        let _ = self
            .harness
            .bus
            .send(
                LEAD_ID,
                MessageType::StatusUpdate,
                format!("failed {}: {error}", task.id),
                vec![("taskId".to_string(), task.id.clone())],
            )
            .await;
    }

    /// Output sink that counts bytes into the agent stats and refreshes
    /// the task claim while the provider is still talking, so a long call
    /// never trips the stale-claim timeout.
    fn claim_refresh_sink(&self, task_id: &str) -> (OutputSink, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<usize>();
        let store = Arc::clone(&self.harness.store);
        let record = Arc::clone(&self.harness.record);
        let agent_id = self.agent_id.clone();
        let task_id = task_id.to_string();

        let refresher = tokio::spawn(async move {
            let mut last_refresh = Instant::now();
            while let Some(bytes) = rx.recv().await {
                record.lock().await.stats.output_bytes += bytes as u64;
                if last_refresh.elapsed() >= Duration::from_secs(30) {
                    let _ = store.refresh_claim(&task_id, &agent_id).await;
                    last_refresh = Instant::now();
                }
            }
        });

        let sink: OutputSink = Arc::new(move |line: &str| {
            let _ = tx.send(line.len());
        });
        (sink, refresher)
    }

    async fn build_prompt(&self, task: &Task, pending_context: &[String]) -> String {
        let record = self.harness.record.lock().await;
        let mut prompt = String::new();
        if !self.harness.system_context.is_empty() {
            prompt.push_str(&self.harness.system_context);
            prompt.push_str("\n\n");
        }
        if let Some(spawn_prompt) = &record.spawn_prompt {
            prompt.push_str(spawn_prompt);
            prompt.push_str("\n\n");
        }
        if !pending_context.is_empty() {
            prompt.push_str("Notes from teammates since your last task:\n");
            for note in pending_context {
                prompt.push_str(&format!("- {note}\n"));
            }
            prompt.push('\n');
        }
        prompt.push_str(&format!(
            "Your task ({}): {}\n\n{}\n",
            task.id, task.title, task.description
        ));
        prompt
    }

    async fn release_current_task(&self) {
        let task_id = self.harness.record.lock().await.current_task_id.clone();
        if let Some(task_id) = task_id {
            let _ = self
                .harness
                .store
                .release_claim(&task_id, &self.agent_id)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{
        AgentSpec, MergeStrategy, ModelSpec, PromptDelivery, ProviderKind,
    };
    use crate::services::task_store::TaskStoreConfig;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    use crate::infrastructure::process::run_command;

    async fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let env: BTreeMap<String, String> = [
            ("GIT_AUTHOR_NAME", "t"),
            ("GIT_AUTHOR_EMAIL", "t@example.com"),
            ("GIT_COMMITTER_NAME", "t"),
            ("GIT_COMMITTER_EMAIL", "t@example.com"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.name", "t"],
            vec!["config", "user.email", "t@example.com"],
            vec!["commit", "--allow-empty", "-m", "root"],
        ] {
            let out = run_command(dir.path(), "git", &args, &env).await.unwrap();
            assert!(out.success(), "{}", out.stderr);
        }
        dir
    }

    /// Provider that writes a file into the worktree and reports done.
    fn scripted_provider(script: &str) -> ProviderConfig {
        ProviderConfig {
            name: "scripted".into(),
            kind: ProviderKind::Subprocess,
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            analysis_args: None,
            prompt_delivery: PromptDelivery::Stdin,
            stream_json: false,
            env: BTreeMap::new(),
        }
    }

    struct TeamFixture {
        _repo: TempDir,
        _state: TempDir,
        store: Arc<TaskStore>,
        git: Arc<WorktreeManager>,
        merge: Arc<MergeManager>,
        events: EventBus,
        mailbox_dir: PathBuf,
        worktree: PathBuf,
    }

    async fn team_fixture() -> TeamFixture {
        let repo = init_repo().await;
        let state = TempDir::new().unwrap();
        let events = EventBus::default();
        let git = Arc::new(WorktreeManager::new(repo.path()));
        let store = Arc::new(TaskStore::open(
            state.path().join("tasks/tasks.json"),
            state.path().join("tasks/claims.lock"),
            TaskStoreConfig::default(),
            events.clone(),
        ));
        let merge = Arc::new(MergeManager::new(
            Arc::clone(&git),
            Arc::clone(&store),
            events.clone(),
            MergeStrategy::RebaseThenMerge,
            None,
        ));
        let worktree = state.path().join("agent-wt");
        git.create_worktree(&worktree, "cohort/agent-1", "main")
            .await
            .unwrap();
        let mailbox_dir = state.path().join("mailbox");
        TeamFixture {
            _repo: repo,
            _state: state,
            store,
            git,
            merge,
            events,
            mailbox_dir,
            worktree,
        }
    }

    fn record_for(fx: &TeamFixture, plan_approval: bool) -> Arc<Mutex<AgentRecord>> {
        let spec = AgentSpec {
            name: "builder".into(),
            model: ModelSpec::new("scripted", "any"),
            spawn_prompt: None,
            require_plan_approval: plan_approval,
        };
        Arc::new(Mutex::new(AgentRecord::new(
            "agent-1".into(),
            &spec,
            fx.worktree.to_string_lossy().into_owned(),
            "cohort/agent-1".into(),
        )))
    }

    fn harness_for(
        fx: &TeamFixture,
        record: Arc<Mutex<AgentRecord>>,
        provider: ProviderConfig,
        cancel: CancellationToken,
    ) -> AgentHarness {
        AgentHarness {
            record,
            store: Arc::clone(&fx.store),
            bus: Arc::new(MessageBus::new(&fx.mailbox_dir, "agent-1")),
            git: Arc::clone(&fx.git),
            invoker: Arc::new(ProviderInvoker::new()),
            merge: Arc::clone(&fx.merge),
            events: fx.events.clone(),
            provider,
            system_context: "You are part of a coding team.".into(),
            target_branch: "main".into(),
            cancel,
        }
    }

    #[tokio::test]
    async fn test_agent_claims_executes_commits_and_reports() {
        let fx = team_fixture().await;
        fx.store
            .add_tasks(vec![Task::new("write file", "create done.txt")])
            .await
            .unwrap();

        let record = record_for(&fx, false);
        let cancel = CancellationToken::new();
        let provider = scripted_provider("echo done > done.txt && echo implementation complete");
        let harness = harness_for(&fx, Arc::clone(&record), provider, cancel.clone());

        let lead_bus = MessageBus::new(&fx.mailbox_dir, LEAD_ID);
        lead_bus.ensure_mailbox().await.unwrap();

        let runtime = AgentRuntime::new(harness).await;
        let handle = tokio::spawn(runtime.run());

        // Wait for the task to complete, then ask the agent to stop.
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let task = fx.store.get_by_id("task-1").await.unwrap();
            if task.is_terminal() {
                break;
            }
            assert!(Instant::now() < deadline, "task never finished");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        lead_bus
            .send("agent-1", MessageType::ShutdownRequest, "wrap up", Vec::new())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(20), handle)
            .await
            .expect("agent should stop after shutdown request")
            .unwrap();

        let task = fx.store.get_by_id("task-1").await.unwrap();
        assert_eq!(task.status, crate::domain::models::TaskStatus::Completed);
        let result = task.result.unwrap();
        assert!(result.commit_sha.is_some());
        assert!(result.modified_files.contains(&"done.txt".to_string()));

        // Completion was reported to the lead and the merge was queued.
        let inbox = lead_bus.poll().await.unwrap();
        assert!(inbox
            .iter()
            .any(|m| m.message_type == MessageType::StatusUpdate
                && m.meta("taskId") == Some("task-1")));
        assert_eq!(fx.merge.queue_len().await, 1);

        let record = record.lock().await;
        assert_eq!(record.state, AgentState::Stopped);
        assert_eq!(record.stats.tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_failed_provider_requeues_task() {
        let fx = team_fixture().await;
        let mut task = Task::new("doomed", "will fail");
        task.max_retries = 1;
        fx.store.add_tasks(vec![task]).await.unwrap();

        let record = record_for(&fx, false);
        let cancel = CancellationToken::new();
        let provider = scripted_provider("echo broken >&2; exit 9");
        let harness = harness_for(&fx, Arc::clone(&record), provider, cancel.clone());

        let lead_bus = MessageBus::new(&fx.mailbox_dir, LEAD_ID);
        lead_bus.ensure_mailbox().await.unwrap();

        let runtime = AgentRuntime::new(harness).await;
        let handle = tokio::spawn(runtime.run());

        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let task = fx.store.get_by_id("task-1").await.unwrap();
            if task.status == crate::domain::models::TaskStatus::Failed {
                break;
            }
            assert!(Instant::now() < deadline, "task never failed terminally");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;

        let task = fx.store.get_by_id("task-1").await.unwrap();
        // max_retries=1: first failure re-queues, second is terminal.
        assert_eq!(task.retry_count, 2);
        assert!(task.error.unwrap().contains("9"));
    }

    #[tokio::test]
    async fn test_plan_rejected_three_times_releases_task() {
        let fx = team_fixture().await;
        fx.store
            .add_tasks(vec![Task::new("planned", "needs approval")])
            .await
            .unwrap();

        let record = record_for(&fx, true);
        let cancel = CancellationToken::new();
        let provider = scripted_provider("echo my plan");
        let harness = harness_for(&fx, Arc::clone(&record), provider, cancel.clone());

        let lead_bus = Arc::new(MessageBus::new(&fx.mailbox_dir, LEAD_ID));
        lead_bus.ensure_mailbox().await.unwrap();

        // Fake lead: reject every plan submission.
        let rejecting_lead = {
            let lead_bus = Arc::clone(&lead_bus);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut rejections = 0;
                while rejections < 3 && !cancel.is_cancelled() {
                    let messages = lead_bus
                        .wait_for_messages(Duration::from_secs(1), &cancel)
                        .await
                        .unwrap_or_default();
                    for message in messages {
                        if message.message_type == MessageType::PlanSubmission {
                            rejections += 1;
                            let _ = lead_bus
                                .send(
                                    &message.from_agent_id,
                                    MessageType::PlanApproval,
                                    "too vague",
                                    vec![("approved".to_string(), "false".to_string())],
                                )
                                .await;
                        }
                    }
                }
                rejections
            })
        };

        let runtime = AgentRuntime::new(harness).await;
        let agent = tokio::spawn(runtime.run());

        let rejections = tokio::time::timeout(Duration::from_secs(30), rejecting_lead)
            .await
            .expect("lead should see three submissions")
            .unwrap();
        assert_eq!(rejections, 3);

        // Stop the agent (it may already be re-claiming the released task);
        // shutdown must leave the task unclaimed with no retry charged.
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(20), agent)
            .await
            .expect("agent should stop after cancellation")
            .unwrap();

        let task = fx.store.get_by_id("task-1").await.unwrap();
        assert_eq!(task.status, crate::domain::models::TaskStatus::Pending);
        assert!(task.claimed_by.is_none());
        assert_eq!(task.retry_count, 0);
    }
}
