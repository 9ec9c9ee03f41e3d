//! Command line surface of the `conductor` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use conductor_core::{BudgetTier, PiiLevel, TaskType};

/// Inspect Conductor routing policies, runtime configs and task graphs.
#[derive(Debug, Parser)]
#[command(name = "conductor", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Runtime config file (YAML); defaults apply when omitted
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Parse and validate a policy document.
    ValidatePolicy {
        /// Policy file (YAML or JSON)
        policy: PathBuf,
    },

    /// Show which route a single request would get.
    Route {
        /// Policy file (YAML or JSON)
        #[arg(long, short)]
        policy: PathBuf,

        #[arg(long)]
        task: TaskType,

        #[arg(long, default_value = "none")]
        pii: PiiLevel,

        #[arg(long, default_value = "standard")]
        tier: BudgetTier,

        /// Rule ids to skip, as after a budget or quality failure
        #[arg(long = "exclude", value_name = "RULE")]
        excluded: Vec<String>,
    },

    /// Validate a task graph and print its execution waves with routes.
    Plan {
        /// Task graph file (YAML or JSON)
        graph: PathBuf,

        /// Policy file (YAML or JSON)
        #[arg(long, short)]
        policy: PathBuf,

        #[arg(long, default_value = "none")]
        pii: PiiLevel,

        #[arg(long, default_value = "standard")]
        tier: BudgetTier,
    },

    /// Load the runtime config, apply CONDUCTOR_* overrides and print it.
    CheckConfig,
}
