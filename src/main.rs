//! Cohort CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;

use cohort::cli::commands::{init, run, status};
use cohort::cli::{Cli, Commands};
use cohort::infrastructure::config::ConfigLoader;
use cohort::infrastructure::logging;

#[tokio::main]
async fn main() {
    // 0 on clean termination (including user abort); 1 on unrecoverable
    // startup error or fatal team failure.
    match dispatch().await {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn dispatch() -> Result<()> {
    let cli = Cli::parse();

    // Init runs before any configuration exists.
    if let Commands::Init { force } = cli.command {
        return init::handle_init(force);
    }

    let config = ConfigLoader::load().context("failed to load configuration")?;
    let _log_guard = logging::init(&config.logging).context("failed to initialize logging")?;

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Status => status::handle_status(&config, cli.json).await,
        Commands::Run {
            request,
            delegate,
            max_agents,
            plan_approval,
        } => {
            run::handle_run(
                config,
                run::RunOptions {
                    request,
                    delegate,
                    max_agents,
                    plan_approval,
                },
            )
            .await
        }
    }
}
