mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "debug"
    } else {
        "info,conductor=debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::ValidatePolicy { policy } => commands::validate_policy(&policy, &config),
        Command::Route {
            policy,
            task,
            pii,
            tier,
            excluded,
        } => commands::route(&policy, &config, task, pii, tier, excluded),
        Command::Plan {
            graph,
            policy,
            pii,
            tier,
        } => commands::plan(&graph, &policy, &config, pii, tier),
        Command::CheckConfig => commands::check_config(&config),
    }
}
