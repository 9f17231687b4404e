//! Command line interface built on clap.
//!
//! [`Cli`] carries the [`Command`] subcommands (`run`, `status`) and the
//! global flags (`--config`, `--max-attempts`, `--timeout`, `--verbose`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Score large image collections against a vision-language model, resumably.
#[derive(Debug, Parser)]
#[command(name = "vlm-batch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./vlm-batch.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Attempts per image before it is recorded as failed.
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Per-request timeout in seconds.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Debug-level logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Score every image under a directory, skipping ones already recorded.
    Run {
        /// Root directory, searched recursively.
        root_dir: PathBuf,

        /// Re-score images that already have a record.
        #[arg(long, default_value_t = false)]
        force_rerun: bool,

        /// Maximum requests in flight.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Record an invalid model response as a failure instead of retrying.
        #[arg(long, default_value_t = false)]
        fail_on_invalid_response: bool,
    },

    /// Count recorded, failed and pending images without calling the service.
    Status {
        root_dir: PathBuf,
    },
}
