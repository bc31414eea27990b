//! Lead orchestrator.
//!
//! The lead decomposes a feature request into tasks, spawns the agent
//! fleet, runs the coordination loop (inbox dispatch, stall watchdog,
//! merge pump), and finally shuts the team down and synthesizes a
//! human-readable summary. The lead owns the agent records and the shared
//! services; agents talk back only through the mailbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::agent::{AgentHarness, AgentRuntime};
use crate::application::decompose::{decomposition_format_help, parse_decomposition};
use crate::domain::models::{
    AgentRecord, AgentSpec, AgentState, Config, Message, MessageType, ProviderConfig,
    TaskStatistics, TaskStatus, TeamPaths, LEAD_ID,
};
use crate::domain::{CoordError, CoordResult};
use crate::infrastructure::git::WorktreeManager;
use crate::infrastructure::providers::ProviderInvoker;
use crate::services::events::EventBus;
use crate::services::mailbox::MessageBus;
use crate::services::merge_queue::MergeManager;
use crate::services::scheduler::ModelScheduler;
use crate::services::task_store::TaskStore;

/// Coordination loop tick.
const TICK: Duration = Duration::from_millis(500);

/// Fallback task duration estimate before any completion is observed.
const DEFAULT_TASK_DURATION: Duration = Duration::from_secs(300);

/// One spawned agent, as the lead tracks it.
struct AgentHandle {
    record: Arc<Mutex<AgentRecord>>,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

/// Watchdog bookkeeping per agent.
#[derive(Default)]
struct AgentProgress {
    last_status_at: Option<Instant>,
    status_check_sent_at: Option<Instant>,
}

/// Final report handed back to the driver.
#[derive(Debug, Clone)]
pub struct TeamReport {
    pub summary: String,
    pub statistics: TaskStatistics,
    pub findings: Vec<String>,
}

/// The lead orchestrator.
pub struct LeadOrchestrator {
    config: Config,
    paths: TeamPaths,
    store: Arc<TaskStore>,
    git: Arc<WorktreeManager>,
    invoker: Arc<ProviderInvoker>,
    merge: Arc<MergeManager>,
    events: EventBus,
    bus: Arc<MessageBus>,
    scheduler: ModelScheduler,
    cancel: CancellationToken,
    lead_provider: ProviderConfig,
    lead_model: String,
    agents: Vec<AgentHandle>,
    progress: HashMap<String, AgentProgress>,
    findings: Vec<String>,
    completed_durations_ms: Vec<u64>,
}

impl LeadOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        paths: TeamPaths,
        store: Arc<TaskStore>,
        git: Arc<WorktreeManager>,
        invoker: Arc<ProviderInvoker>,
        merge: Arc<MergeManager>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> CoordResult<Self> {
        let lead_spec = config
            .team
            .models
            .first()
            .ok_or_else(|| CoordError::ValidationFailed("no models configured".to_string()))?
            .clone();
        let lead_provider = config
            .provider(&lead_spec.provider)
            .ok_or_else(|| {
                CoordError::ValidationFailed(format!("unknown provider: {}", lead_spec.provider))
            })?
            .clone();

        let bus = Arc::new(MessageBus::new(paths.mailbox_dir(), LEAD_ID));
        let scheduler = ModelScheduler::new(config.team.models.clone());

        Ok(Self {
            config,
            paths,
            store,
            git,
            invoker,
            merge,
            events,
            bus,
            scheduler,
            cancel,
            lead_provider,
            lead_model: lead_spec.model,
            agents: Vec::new(),
            progress: HashMap::new(),
            findings: Vec::new(),
            completed_durations_ms: Vec::new(),
        })
    }

    /// Run the whole lifecycle: setup, coordination, finalize.
    pub async fn run(&mut self, request: &str) -> CoordResult<TeamReport> {
        self.setup(request).await?;
        self.coordination_loop().await;
        self.finalize().await
    }

    // ---- Setup ----------------------------------------------------------

    async fn setup(&mut self, request: &str) -> CoordResult<()> {
        tokio::fs::create_dir_all(self.paths.tasks_dir()).await?;
        tokio::fs::create_dir_all(self.paths.mailbox_dir()).await?;
        self.bus.ensure_mailbox().await?;
        self.snapshot_team_config().await;
        self.scheduler.reset();

        let tasks = self.decompose(request).await?;
        if tasks.is_empty() {
            return Err(CoordError::ValidationFailed(
                "decomposition produced no tasks".to_string(),
            ));
        }
        let task_count = tasks.len();

        for warning in MergeManager::detect_file_overlap(&tasks) {
            warn!(
                file = %warning.file,
                tasks = ?warning.task_ids,
                "multiple tasks expect to touch the same file"
            );
        }

        self.store.add_tasks(tasks).await?;

        let agent_count = task_count.min(self.config.team.max_agents);
        for index in 0..agent_count {
            self.spawn_agent(index + 1).await?;
        }
        info!(tasks = task_count, agents = agent_count, "team is underway");
        Ok(())
    }

    /// Persist the effective team configuration into the team directory.
    async fn snapshot_team_config(&self) {
        match serde_json::to_string_pretty(&self.config.team) {
            Ok(json) => {
                if let Err(err) = tokio::fs::write(self.paths.config_file(), json).await {
                    warn!(error = %err, "failed to write team config snapshot");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize team config"),
        }
    }

    async fn decompose(&self, request: &str) -> CoordResult<Vec<crate::domain::models::Task>> {
        let prompt = format!(
            "Break the following feature request into independent, mergeable tasks \
             for a team of coding agents working on this repository. Order tasks so \
             that dependencies come first and reference dependencies by the exact \
             title of the earlier task.\n\n{}\nFeature request:\n{}\n",
            decomposition_format_help(),
            request
        );
        let result = self.lead_invoke(&prompt).await?;
        Ok(parse_decomposition(&result))
    }

    /// A provider call on the lead's behalf: always analysis-only, plus a
    /// coordination-only instruction in delegate mode.
    async fn lead_invoke(&self, prompt: &str) -> CoordResult<String> {
        let mut full_prompt = String::new();
        if self.config.team.delegate_mode {
            full_prompt.push_str(
                "You are coordinating a team. You must not edit code or files; \
                 only analyze and reply with text.\n\n",
            );
        }
        full_prompt.push_str(prompt);

        let result = self
            .invoker
            .invoke(
                &self.lead_provider.to_analysis(),
                &self.lead_model,
                &full_prompt,
                self.git.repo_root(),
                None,
                &self.cancel,
            )
            .await?;
        if !result.success {
            return Err(CoordError::Provider(
                result
                    .error
                    .unwrap_or_else(|| "lead provider call failed".to_string()),
            ));
        }
        Ok(result.parsed_text)
    }

    async fn spawn_agent(&mut self, index: usize) -> CoordResult<()> {
        let agent_id = format!("agent-{index}");
        let model = self
            .scheduler
            .next_model()
            .ok_or_else(|| CoordError::ValidationFailed("no models configured".to_string()))?;
        let provider = self
            .config
            .provider(&model.provider)
            .ok_or_else(|| {
                CoordError::ValidationFailed(format!("unknown provider: {}", model.provider))
            })?
            .clone();

        let branch = format!("cohort/{}/{agent_id}", self.config.team.name);
        let worktree_path = self.paths.worktrees_dir().join(&agent_id);
        self.git
            .create_worktree(&worktree_path, &branch, &self.config.team.target_branch)
            .await?;

        let spec = AgentSpec {
            name: agent_id.clone(),
            model,
            spawn_prompt: None,
            require_plan_approval: self.config.team.require_plan_approval,
        };
        let record = Arc::new(Mutex::new(AgentRecord::new(
            agent_id.clone(),
            &spec,
            worktree_path.to_string_lossy().into_owned(),
            branch,
        )));

        let cancel = self.cancel.child_token();
        let harness = AgentHarness {
            record: Arc::clone(&record),
            store: Arc::clone(&self.store),
            bus: Arc::new(MessageBus::new(self.paths.mailbox_dir(), &agent_id)),
            git: Arc::clone(&self.git),
            invoker: Arc::clone(&self.invoker),
            merge: Arc::clone(&self.merge),
            events: self.events.clone(),
            provider,
            system_context: format!(
                "You are {agent_id}, one agent on the team '{}' working in an isolated \
                 git worktree. Complete only your assigned task; your branch is merged \
                 back automatically.",
                self.config.team.name
            ),
            target_branch: self.config.team.target_branch.clone(),
            cancel: cancel.clone(),
        };

        let runtime = AgentRuntime::new(harness).await;
        let join = tokio::spawn(runtime.run());
        info!(agent_id, "agent spawned");

        self.progress.insert(agent_id, AgentProgress::default());
        self.agents.push(AgentHandle {
            record,
            cancel,
            join,
        });
        Ok(())
    }

    // ---- Coordination loop ----------------------------------------------

    async fn coordination_loop(&mut self) {
        info!("entering coordination loop");
        loop {
            if self.cancel.is_cancelled() {
                info!("cancellation requested, leaving coordination loop");
                return;
            }

            let polled = self.bus.poll().await;
            match polled {
                Ok(messages) => {
                    for message in messages {
                        self.handle_message(message).await;
                    }
                }
                Err(err) => warn!(error = %err, "lead inbox poll failed"),
            }

            self.watch_for_stalls().await;

            match self.merge.process_next(&self.cancel).await {
                Ok(Some(outcome)) if !outcome.merged => {
                    self.findings.push(format!(
                        "merge of {} requires manual intervention: {}",
                        outcome.task_id,
                        outcome.error.unwrap_or_default()
                    ));
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "merge pump failed"),
            }

            self.fail_orphaned_tasks().await;

            if self.work_is_done().await {
                info!("all tasks terminal and all agents quiescent");
                return;
            }

            tokio::time::sleep(TICK).await;
        }
    }

    async fn handle_message(&mut self, message: Message) {
        match message.message_type {
            MessageType::StatusUpdate => {
                let progress = self
                    .progress
                    .entry(message.from_agent_id.clone())
                    .or_default();
                progress.last_status_at = Some(Instant::now());
                progress.status_check_sent_at = None;

                if let Some(task_id) = message.meta("taskId") {
                    if let Some(task) = self.store.get_by_id(task_id).await {
                        if let Some(result) = &task.result {
                            self.completed_durations_ms.push(result.duration_ms);
                        }
                    }
                }
                debug!(from = %message.from_agent_id, content = %message.content, "status update");
            }
            MessageType::PlanSubmission => {
                self.review_plan(&message).await;
            }
            MessageType::ShutdownResponse => {
                if !message.meta_flag("accepted") {
                    info!(
                        from = %message.from_agent_id,
                        reason = %message.content,
                        "agent deferred shutdown"
                    );
                }
            }
            MessageType::Text | MessageType::Broadcast => {
                self.findings
                    .push(format!("{}: {}", message.from_agent_id, message.content));
            }
            MessageType::ShutdownRequest
            | MessageType::PlanApproval
            | MessageType::TaskAssignment => {
                debug!(
                    message_type = message.message_type.as_str(),
                    "unexpected message type in lead inbox"
                );
            }
        }
    }

    /// Review a submitted plan with one provider call and reply.
    async fn review_plan(&mut self, message: &Message) {
        let task_id = message.meta("taskId").unwrap_or_default().to_string();
        let task_description = match self.store.get_by_id(&task_id).await {
            Some(task) => format!("{}: {}", task.title, task.description),
            None => "unknown task".to_string(),
        };

        let prompt = format!(
            "An agent proposes this plan for the task below. Reply APPROVE if the \
             plan is adequate for the task, or REJECT followed by concrete feedback.\n\n\
             Task: {task_description}\n\nPlan:\n{}\n",
            message.content
        );

        let (approved, feedback) = match self.lead_invoke(&prompt).await {
            Ok(reply) => {
                let rejected = reply.to_uppercase().contains("REJECT");
                (!rejected, reply)
            }
            Err(err) => {
                // Approval must not wedge the agent; fall back to approving.
                warn!(task_id, error = %err, "plan review call failed, approving by default");
                (true, "approved (review unavailable)".to_string())
            }
        };

        info!(task_id, approved, from = %message.from_agent_id, "plan reviewed");
        let _ = self
            .bus
            .send(
                &message.from_agent_id,
                MessageType::PlanApproval,
                feedback,
                vec![("approved".to_string(), approved.to_string())],
            )
            .await;
    }

    /// Release tasks held by agents that have gone quiet.
    ///
    /// An agent Working for more than twice the moving-average task
    /// duration with no status heartbeat gets a status-check message; if
    /// another silence window passes with no response, its task is failed
    /// (which re-queues while retries remain).
    async fn watch_for_stalls(&mut self) {
        let silence = Duration::from_secs(self.config.timeouts.heartbeat_silence_secs);
        let stall_threshold = self.average_task_duration() * 2;

        for handle in &self.agents {
            let (agent_id, state, seconds_in_state, task_id) = {
                let record = handle.record.lock().await;
                (
                    record.agent_id.clone(),
                    record.state,
                    record.seconds_in_state(),
                    record.current_task_id.clone(),
                )
            };
            if state != AgentState::Working {
                continue;
            }
            let Some(task_id) = task_id else { continue };
            if Duration::from_secs(seconds_in_state.max(0) as u64) <= stall_threshold {
                continue;
            }

            let progress = self.progress.entry(agent_id.clone()).or_default();
            let heard_recently = progress
                .last_status_at
                .is_some_and(|at| at.elapsed() < silence);
            if heard_recently {
                continue;
            }

            match progress.status_check_sent_at {
                None => {
                    info!(agent_id, task_id, "agent quiet past stall threshold, sending status check");
                    progress.status_check_sent_at = Some(Instant::now());
                    let _ = self
                        .bus
                        .send(
                            &agent_id,
                            MessageType::Text,
                            "status check: are you still making progress on your task?",
                            Vec::new(),
                        )
                        .await;
                }
                Some(sent_at) if sent_at.elapsed() >= silence => {
                    warn!(agent_id, task_id, "no response to status check, releasing task");
                    let _ = self
                        .store
                        .fail(&task_id, "released by lead: agent unresponsive")
                        .await;
                    progress.status_check_sent_at = None;
                }
                Some(_) => {}
            }
        }
    }

    /// Fail tasks that can never become claimable.
    ///
    /// A pending task whose dependency failed terminally (or references no
    /// known task) will wait forever; once nothing is running or claimable,
    /// charge it a failure so the run can terminate. Chains resolve over
    /// successive ticks as each level becomes terminal.
    async fn fail_orphaned_tasks(&self) {
        let stats = self.store.statistics().await;
        if stats.in_progress > 0 || stats.pending == 0 {
            return;
        }
        if !self.store.get_claimable().await.is_empty() {
            return;
        }

        let all = self.store.get_all().await;
        for task in all.iter().filter(|t| t.status == TaskStatus::Pending) {
            let dead_dep = task.depends_on.iter().find(|dep| {
                match all.iter().find(|t| t.id == **dep) {
                    None => true,
                    Some(dep_task) => dep_task.status == TaskStatus::Failed,
                }
            });
            if let Some(dep) = dead_dep {
                warn!(task_id = %task.id, dependency = %dep, "task can never run, failing it");
                let _ = self
                    .store
                    .fail(&task.id, &format!("dependency {dep} failed or is unknown"))
                    .await;
            }
        }
    }

    fn average_task_duration(&self) -> Duration {
        if self.completed_durations_ms.is_empty() {
            return DEFAULT_TASK_DURATION;
        }
        let sum: u64 = self.completed_durations_ms.iter().sum();
        Duration::from_millis(sum / self.completed_durations_ms.len() as u64)
    }

    async fn work_is_done(&self) -> bool {
        let stats = self.store.statistics().await;
        if !stats.all_terminal() {
            return false;
        }
        if !self.merge.drained().await {
            return false;
        }
        for handle in &self.agents {
            let state = handle.record.lock().await.state;
            if !matches!(state, AgentState::Idle | AgentState::Stopped | AgentState::Error) {
                return false;
            }
        }
        true
    }

    // ---- Finalize -------------------------------------------------------

    async fn finalize(&mut self) -> CoordResult<TeamReport> {
        info!("finalizing team run");
        self.shutdown_agents().await;
        self.drain_merges().await;

        let statistics = self.store.statistics().await;
        let summary = self.synthesize(&statistics).await;
        self.cleanup().await;

        Ok(TeamReport {
            summary,
            statistics,
            findings: std::mem::take(&mut self.findings),
        })
    }

    /// Graceful shutdown, then force-stop stragglers after the grace
    /// period.
    async fn shutdown_agents(&mut self) {
        for handle in &self.agents {
            let agent_id = handle.record.lock().await.agent_id.clone();
            let _ = self
                .bus
                .send(
                    &agent_id,
                    MessageType::ShutdownRequest,
                    "work is done; shut down",
                    Vec::new(),
                )
                .await;
        }

        let grace = Duration::from_secs(self.config.timeouts.shutdown_grace_secs);
        let deadline = Instant::now() + grace;
        loop {
            let mut all_stopped = true;
            for handle in &self.agents {
                if !handle.record.lock().await.state.is_terminal() {
                    all_stopped = false;
                    break;
                }
            }
            if all_stopped {
                break;
            }
            if Instant::now() >= deadline {
                warn!("shutdown grace period expired, force-stopping agents");
                for handle in &self.agents {
                    let record = handle.record.lock().await;
                    if !record.state.is_terminal() {
                        error!(agent_id = %record.agent_id, "force-stopping agent");
                        handle.cancel.cancel();
                    }
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        let joins: Vec<_> = self.agents.drain(..).map(|handle| handle.join).collect();
        if tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(joins))
            .await
            .is_err()
        {
            warn!("some agent tasks did not finish after force-stop");
        }
    }

    /// Land whatever is still mergeable before cleanup.
    async fn drain_merges(&self) {
        for _ in 0..64 {
            match self.merge.process_next(&self.cancel).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "merge drain failed");
                    break;
                }
            }
        }
    }

    /// One provider call to turn results and findings into prose.
    async fn synthesize(&self, statistics: &TaskStatistics) -> String {
        let mut prompt = String::from(
            "Summarize this team run for the user: what was built, what failed, \
             and anything needing follow-up. Be concise.\n\n",
        );
        prompt.push_str(&format!(
            "Tasks: {} total, {} completed, {} failed.\n\n",
            statistics.total, statistics.completed, statistics.failed
        ));
        for task in self.store.get_all().await {
            let line = match (&task.status, &task.result) {
                (TaskStatus::Completed, Some(result)) => format!(
                    "- {} ({}): completed, commit {:?}, files {:?}\n",
                    task.id, task.title, result.commit_sha, result.modified_files
                ),
                (TaskStatus::Failed, _) => format!(
                    "- {} ({}): FAILED: {}\n",
                    task.id,
                    task.title,
                    task.error.as_deref().unwrap_or("unknown")
                ),
                _ => format!("- {} ({}): {}\n", task.id, task.title, task.status.as_str()),
            };
            prompt.push_str(&line);
        }
        if !self.findings.is_empty() {
            prompt.push_str("\nAgent findings:\n");
            for finding in &self.findings {
                prompt.push_str(&format!("- {finding}\n"));
            }
        }

        match self.lead_invoke(&prompt).await {
            Ok(summary) if !summary.trim().is_empty() => summary,
            _ => format!(
                "{} of {} tasks completed ({} failed).",
                statistics.completed, statistics.total, statistics.failed
            ),
        }
    }

    /// Remove worktrees, mailbox files, and the tasks file. Best-effort.
    async fn cleanup(&self) {
        let worktrees_dir = self.paths.worktrees_dir();
        if let Ok(mut entries) = tokio::fs::read_dir(&worktrees_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Err(err) = self.git.remove_worktree(&entry.path()).await {
                    warn!(path = %entry.path().display(), error = %err, "worktree cleanup failed");
                }
            }
        }
        MessageBus::cleanup_dir(&self.paths.mailbox_dir()).await;
        if let Err(err) = tokio::fs::remove_file(self.paths.tasks_file()).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %err, "tasks file cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{MergeStrategy, ModelSpec, PromptDelivery, ProviderKind};
    use crate::services::task_store::TaskStoreConfig;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    use crate::infrastructure::process::run_command;

    async fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let env: BTreeMap<String, String> = BTreeMap::new();
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

    /// Provider used for every role in the end-to-end test. The lead's
    /// decomposition call sees "Break the following feature request" in
    /// the prompt and answers with two tasks; agent calls write a
    /// worktree-unique file; everything else gets a plain sentence.
    fn scripted_provider() -> ProviderConfig {
        let script = r#"
input=$(cat)
case "$input" in
  *"Break the following feature request"*)
    printf 'TASK: First piece\nDESCRIPTION: build part one\nPRIORITY: High\nFILES: one.txt\n'
    printf 'TASK: Second piece\nDESCRIPTION: build part two\nDEPENDS: First piece\nFILES: two.txt\n'
    ;;
  *"Your task"*)
    echo done > "out-$$.txt"
    echo "implementation complete"
    ;;
  *)
    echo "summary: the team finished"
    ;;
esac
"#;
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

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_end_to_end_team_run() {
        let repo = init_repo().await;
        let state = TempDir::new().unwrap();

        let mut config = Config::default();
        config.root_dir = state.path().to_path_buf();
        config.team.name = "alpha".into();
        config.team.max_agents = 2;
        config.providers = vec![scripted_provider()];
        config.team.models = vec![ModelSpec::new("scripted", "any")];

        let paths = TeamPaths::new(&config.root_dir, &config.team.name);
        let events = EventBus::default();
        let git = Arc::new(WorktreeManager::new(repo.path()));
        let store = Arc::new(TaskStore::open(
            paths.tasks_file(),
            paths.claims_lock(),
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
        let cancel = CancellationToken::new();

        let mut lead = LeadOrchestrator::new(
            config,
            paths.clone(),
            Arc::clone(&store),
            Arc::clone(&git),
            Arc::new(ProviderInvoker::new()),
            merge,
            events,
            cancel,
        )
        .unwrap();

        let report = tokio::time::timeout(
            Duration::from_secs(120),
            lead.run("Build the two pieces"),
        )
        .await
        .expect("team run timed out")
        .expect("team run failed");

        assert_eq!(report.statistics.total, 2);
        assert_eq!(report.statistics.completed, 2);
        assert_eq!(report.statistics.failed, 0);
        assert!(!report.summary.is_empty());

        // Both agents' work landed on main in the primary checkout.
        let landed: Vec<_> = std::fs::read_dir(repo.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("out-"))
            .collect();
        assert_eq!(landed.len(), 2, "both merges should have landed");

        // Cleanup removed the shared task file and mailboxes.
        assert!(!paths.tasks_file().exists());
    }
}
