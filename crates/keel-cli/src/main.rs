//! keel CLI.
//!
//! Creates, scales, upgrades and deletes Kubernetes clusters over SSH.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use keel_cli::Cli;
use keel_common::telemetry::{init_logging, LogConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig {
        format: cli.global.log_format.into(),
        ..Default::default()
    }) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
