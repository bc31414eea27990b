//! `cohort run`: stand up a team and drive it to completion.

use anyhow::{bail, Context, Result};
use console::style;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::lead::LeadOrchestrator;
use crate::domain::models::{Config, ProviderKind, TeamPaths};
use crate::infrastructure::git::WorktreeManager;
use crate::infrastructure::providers::{AnthropicAdapter, ProviderInvoker};
use crate::services::conflict::ConflictNegotiator;
use crate::services::events::EventBus;
use crate::services::merge_queue::MergeManager;
use crate::services::task_store::{TaskStore, TaskStoreConfig};

pub struct RunOptions {
    pub request: String,
    pub delegate: bool,
    pub max_agents: Option<usize>,
    pub plan_approval: bool,
}

pub async fn handle_run(mut config: Config, options: RunOptions) -> Result<()> {
    if options.delegate {
        config.team.delegate_mode = true;
    }
    if options.plan_approval {
        config.team.require_plan_approval = true;
    }
    if let Some(max_agents) = options.max_agents {
        config.team.max_agents = max_agents;
    }

    let repo_root = std::env::current_dir().context("cannot resolve working directory")?;
    let git = Arc::new(WorktreeManager::new(&repo_root));
    let target = git
        .current_branch()
        .await
        .context("not a git repository (or git is not installed)")?;
    if config.team.target_branch != target {
        info!(
            configured = %config.team.target_branch,
            checked_out = %target,
            "target branch differs from checked-out branch"
        );
    }

    let mut invoker = ProviderInvoker::new();
    for provider in &config.providers {
        if provider.kind == ProviderKind::InProcess {
            match AnthropicAdapter::from_env() {
                Some(adapter) => invoker.register_adapter(&provider.name, Arc::new(adapter)),
                None => bail!(
                    "provider '{}' is in-process but ANTHROPIC_API_KEY is not set",
                    provider.name
                ),
            }
        }
    }
    let invoker = Arc::new(invoker);

    let paths = TeamPaths::new(&config.root_dir, &config.team.name);
    let events = EventBus::default();
    let store = Arc::new(TaskStore::open(
        paths.tasks_file(),
        paths.claims_lock(),
        TaskStoreConfig {
            stale_claim_timeout: std::time::Duration::from_secs(config.timeouts.stale_claim_secs),
            lock_timeout: std::time::Duration::from_millis(config.timeouts.lock_timeout_ms),
        },
        events.clone(),
    ));

    // Conflicts negotiate with the lead's model.
    let negotiator = config.team.models.first().and_then(|spec| {
        config.provider(&spec.provider).map(|provider| {
            Arc::new(ConflictNegotiator::new(
                Arc::clone(&invoker),
                provider,
                spec.model.clone(),
            ))
        })
    });
    let merge = Arc::new(MergeManager::new(
        Arc::clone(&git),
        Arc::clone(&store),
        events.clone(),
        config.team.merge_strategy,
        negotiator,
    ));

    // First Ctrl-C drains gracefully; the driver still exits clean.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, shutting the team down");
                cancel.cancel();
            }
        });
    }

    let mut lead = LeadOrchestrator::new(
        config,
        paths,
        store,
        git,
        invoker,
        merge,
        events,
        cancel.clone(),
    )?;

    let report = lead.run(&options.request).await?;

    println!();
    if cancel.is_cancelled() {
        println!("{} run aborted by user", style("!").yellow());
    }
    println!("{}", style("── team summary ──").bold());
    println!("{}", report.summary.trim());
    println!(
        "\n{} {}/{} tasks completed, {} failed",
        style("✓").green(),
        report.statistics.completed,
        report.statistics.total,
        report.statistics.failed
    );
    for finding in &report.findings {
        println!("  {} {finding}", style("•").dim());
    }

    if report.statistics.total > 0 && report.statistics.completed == 0 && !cancel.is_cancelled() {
        bail!("no task completed; see logs for details");
    }
    Ok(())
}
