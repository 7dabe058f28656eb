//! keel CLI library.

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use keel_common::telemetry::LogFormat;

/// keel - Kubernetes clusters on plain hosts.
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Settings file (defaults to ~/.keel/config.json).
    #[arg(long, global = true, env = "KEEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Local directory holding images.
    #[arg(long, global = true, env = "KEEL_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create, change or upgrade a cluster from a cluster file.
    Apply(commands::apply::ApplyArgs),
    /// Scale masters or nodes of an applied cluster.
    Scale(commands::scale::ScaleArgs),
    /// Tear down an applied cluster.
    Delete(commands::delete::DeleteArgs),
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let global = self.global;
        match self.command {
            Commands::Apply(args) => commands::apply::run(&global, args).await,
            Commands::Scale(args) => commands::scale::run(&global, args).await,
            Commands::Delete(args) => commands::delete::run(&global, args).await,
        }
    }
}
