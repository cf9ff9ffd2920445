//! Command-line interface definitions using clap.

use crate::paths;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Pooled mailbox batch exporter.
#[derive(Parser, Debug)]
#[command(name = "mbxport")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the shared state database.
    #[arg(long = "db", env = "MBX_DB_PATH", global = true, default_value_os_t = paths::get_state_db_path())]
    pub db_path: PathBuf,

    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Export mailboxes with a pool of worker processes.
    Run(RunArgs),

    /// Internal worker loop, spawned by the supervisor.
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Show queue items and job records.
    Status(StatusArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// User identifiers to export.
    pub users: Vec<String>,

    /// File with one user identifier per line. Blank lines are ignored.
    #[arg(long, value_name = "FILE")]
    pub user_list: Option<PathBuf>,

    /// Number of worker processes.
    #[arg(short = 'n', long, default_value_t = 2)]
    pub processes: usize,

    /// Resume date: fine-grained export windows start here (YYYY-MM-DD).
    #[arg(long)]
    pub start_date: Option<NaiveDate>,

    /// Root of the mailbox source tree.
    #[arg(long, env = "MBX_MAIL_ROOT")]
    pub mail_root: PathBuf,

    /// Destination root for exported mail.
    #[arg(long, env = "MBX_EXPORT_ROOT", default_value_os_t = paths::get_export_root())]
    pub export_root: PathBuf,

    /// Directory for per-worker log files.
    #[arg(long, default_value_os_t = paths::get_log_dir())]
    pub log_dir: PathBuf,

    /// Suffix appended to each user identifier to form the mail address.
    #[arg(long, default_value = "")]
    pub mail_suffix: String,

    /// Supervisor poll interval in seconds.
    #[arg(long, default_value_t = 10, hide = true)]
    pub poll_interval: u64,

    /// Sleep between sub-range retry attempts, in seconds.
    #[arg(long, default_value_t = 30, hide = true)]
    pub retry_backoff: u64,

    /// Seconds before a PROCESSING item is presumed stuck.
    #[arg(long, default_value_t = 180, hide = true)]
    pub processing_timeout: u64,
}

/// Arguments for the hidden worker subcommand.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Root of the mailbox source tree.
    #[arg(long)]
    pub mail_root: PathBuf,

    /// Destination root for exported mail.
    #[arg(long)]
    pub export_root: PathBuf,

    /// Suffix appended to each user identifier to form the mail address.
    #[arg(long, default_value = "")]
    pub mail_suffix: String,

    /// Resume date for fine-grained export windows.
    #[arg(long)]
    pub start_date: Option<NaiveDate>,

    /// Slot name, used for log context.
    #[arg(long, default_value = "worker-0")]
    pub slot: String,

    /// Sleep between sub-range retry attempts, in seconds.
    #[arg(long, default_value_t = 30, hide = true)]
    pub retry_backoff: u64,
}

/// Arguments for the status command.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Use ASCII table borders instead of Unicode.
    #[arg(long)]
    pub ascii: bool,
}
