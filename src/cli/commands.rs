//! CLI commands for crmq.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use uuid::Uuid;

use crate::models::TaskKind;

/// crmq - coordination core for CRM worker swarms
#[derive(Parser, Debug)]
#[command(name = "crmq", version, about = "Budget-aware task queue for CRM workers")]
pub struct Cli {
    /// Path to config file (overrides default locations)
    #[arg(long, global = true, env = "CRMQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// The subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Enqueue a CRM operation
    Enqueue {
        /// Operation kind (create, query, update, delete, bulk-create, bulk-update)
        #[arg(long, short = 'k')]
        kind: TaskKind,

        /// Record type, e.g. Account
        #[arg(long, short = 'o')]
        object_type: String,

        /// Payload as JSON (fields, {"Id": ...}, or a SOQL string)
        #[arg(long, short = 'p')]
        payload: String,

        /// Lower runs first
        #[arg(long, default_value = "5")]
        priority: u16,

        /// Idempotency key (derived from the content when omitted)
        #[arg(long)]
        idempotency_key: Option<String>,

        /// Retryable failures allowed before dead-lettering
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one task
    Status {
        /// Task ID (UUID)
        task_id: Uuid,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Task counts by status
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Current call budget window
    Budget {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Suggested worker count for the current backlog
    ScaleHint {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a worker loop until SIGINT/SIGTERM
    Worker {
        /// Worker ID (random when omitted)
        #[arg(long, short = 'w', env = "CRMQ_WORKER_ID")]
        worker_id: Option<String>,

        /// Tasks leased per cycle
        #[arg(long)]
        batch_size: Option<usize>,

        /// Also take bulk kinds one record at a time
        #[arg(long)]
        include_bulk: bool,

        /// Run the sweeper alongside the worker
        #[arg(long)]
        sweep: bool,

        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Run the batcher until SIGINT/SIGTERM
    Batcher {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Revert expired leases and repair the ordering index
    Sweep {
        /// Keep sweeping at this interval (seconds) instead of exiting
        #[arg(long)]
        every: Option<u64>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Manage configuration
    Config {
        /// The config subcommand to run
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Configuration management subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show resolved configuration
    Show,
    /// Validate configuration
    Validate,
    /// Show config file locations
    Paths,
}

impl Cli {
    /// Parse CLI arguments
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
