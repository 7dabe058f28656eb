//! Delete command - Tear down an applied cluster.
//!
//! Usage: keel delete --cluster <name> [--force].
//!
//! Every host is reset and the rootfs removed; the local record is
//! forgotten once teardown finishes.

use clap::Args;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use super::{applier_for, cancel_on_interrupt, load_settings, recorded_cluster, report};
use crate::{GlobalArgs, Result};

/// Delete a cluster.
#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Cluster name.
    #[arg(long)]
    pub cluster: String,

    /// Skip confirmation prompt.
    #[arg(short = 'f', long)]
    pub force: bool,
}

pub async fn run(global: &GlobalArgs, args: DeleteArgs) -> Result<()> {
    let settings = load_settings(global)?;
    let recorded = recorded_cluster(&settings, &args.cluster)?;

    if !args.force {
        println!(
            "This will reset {} host(s) of cluster '{}'.",
            recorded.all_hosts().len(),
            args.cluster
        );
        print!("Are you sure? [y/N] ");
        tokio::io::stdout().flush().await?;

        let mut input = String::new();
        let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
        reader.read_line(&mut input).await?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted");
            return Ok(());
        }
    }

    let applier = applier_for(&recorded, settings, cancel_on_interrupt());
    let plan = applier.delete(&args.cluster).await?;
    report(&args.cluster, &plan);
    Ok(())
}
