//! `cohort init`: scaffold the project-local configuration.

use anyhow::{bail, Context, Result};
use console::style;
use std::path::Path;

const CONFIG_TEMPLATE: &str = r#"# Cohort team configuration.
# Values here merge over built-in defaults; .cohort/local.yaml and
# COHORT_* environment variables override them in turn.

root_dir: .cohort

team:
  name: default
  max_agents: 3
  target_branch: main
  # RebaseThenMerge | MergeDirect | Sequential
  merge_strategy: RebaseThenMerge
  require_plan_approval: false
  delegate_mode: false
  models:
    - provider: claude
      model: sonnet

providers:
  - name: claude
    command: claude
    args: ["--print", "--model", "{model}", "--dangerously-skip-permissions"]
    analysis_args: ["--print", "--model", "{model}"]
    prompt_delivery: Stdin
    stream_json: false
    env: {}

timeouts:
  lock_timeout_ms: 5000
  stale_claim_secs: 300
  shutdown_grace_secs: 60
  heartbeat_silence_secs: 60

logging:
  level: info
  format: pretty
"#;

pub fn handle_init(force: bool) -> Result<()> {
    let config_path = Path::new(".cohort/config.yaml");
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    std::fs::create_dir_all(".cohort").context("failed to create .cohort directory")?;
    std::fs::write(config_path, CONFIG_TEMPLATE)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    println!(
        "{} wrote {}",
        style("✓").green(),
        style(config_path.display()).bold()
    );
    Ok(())
}
