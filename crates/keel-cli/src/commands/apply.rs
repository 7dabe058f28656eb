//! Apply command - Move a cluster towards a cluster file.
//!
//! Usage: keel apply -f <Clusterfile>.

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use super::{applier_for, cancel_on_interrupt, load_settings, read_cluster_file, report};
use crate::{GlobalArgs, Result};

/// Create, change or upgrade a cluster.
#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Path to the cluster file.
    #[arg(short = 'f', long = "file")]
    pub file: PathBuf,
}

pub async fn run(global: &GlobalArgs, args: ApplyArgs) -> Result<()> {
    let settings = load_settings(global)?;
    let desired = read_cluster_file(&args.file)?;
    let name = desired.name().to_string();
    info!(cluster = %name, file = %args.file.display(), "applying cluster file");

    let applier = applier_for(&desired, settings, cancel_on_interrupt());
    let plan = applier.apply(desired).await?;
    report(&name, &plan);
    Ok(())
}
