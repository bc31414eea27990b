//! `cohort status`: task-store statistics for the configured team.

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, Cell, Table};

use crate::domain::models::{Config, TeamPaths};
use crate::services::events::EventBus;
use crate::services::task_store::{TaskStore, TaskStoreConfig};

pub async fn handle_status(config: &Config, json: bool) -> Result<()> {
    let paths = TeamPaths::new(&config.root_dir, &config.team.name);
    let store = TaskStore::open(
        paths.tasks_file(),
        paths.claims_lock(),
        TaskStoreConfig::default(),
        EventBus::default(),
    );

    let tasks = store.get_all().await;
    let stats = store.statistics().await;

    if json {
        let payload = serde_json::json!({
            "team": config.team.name,
            "statistics": stats,
            "tasks": tasks,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "ID", "Title", "Priority", "Status", "Merge", "Claimed by", "Retries",
    ]);
    for task in &tasks {
        table.add_row(vec![
            Cell::new(&task.id),
            Cell::new(&task.title),
            Cell::new(task.priority.as_str()),
            Cell::new(task.status.as_str()),
            Cell::new(format!("{:?}", task.merge_state)),
            Cell::new(task.claimed_by.as_deref().unwrap_or("-")),
            Cell::new(task.retry_count),
        ]);
    }
    println!("{table}");
    println!(
        "team '{}': {}/{} completed ({:.0}%), {} failed, {} in progress",
        config.team.name,
        stats.completed,
        stats.total,
        stats.completion_percent,
        stats.failed,
        stats.in_progress
    );
    Ok(())
}
