//! CLI command definitions.

use clap::{Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        #[arg(default_value = "flotilla.yaml")]
        config: PathBuf,
    },

    /// List configured agents
    Agents {
        #[arg(default_value = "flotilla.yaml")]
        config: PathBuf,

        /// Probe every agent once and show its health
        #[arg(long)]
        probe: bool,
    },

    /// Run the orchestrator with health probing until Ctrl+C
    Serve {
        #[arg(default_value = "flotilla.yaml")]
        config: PathBuf,
    },

    /// Submit one task and wait for it
    Task {
        config: PathBuf,

        /// Capability the task requires
        #[arg(short, long)]
        capability: String,

        /// Payload as JSON; anything that is not valid JSON is sent as a string
        #[arg(short, long)]
        payload: String,

        /// Lower values are more urgent
        #[arg(long, default_value_t = 0)]
        priority: i32,

        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,

        /// Total attempt budget
        #[arg(long, default_value_t = 3)]
        retries: u32,

        /// Wait for capacity instead of failing when every agent is busy
        #[arg(long)]
        queue: bool,
    },

    /// Run a workflow file and wait for it
    Workflow {
        config: PathBuf,

        /// Path to workflow definition
        workflow: PathBuf,
    },

    /// Print the JSON schema of emitted events
    Schema,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
