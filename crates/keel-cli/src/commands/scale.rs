//! Scale command - Change one host group of an applied cluster.
//!
//! Usage: keel scale masters|nodes <count|iplist> --cluster <name>.

use clap::{Args, ValueEnum};

use keel_apply::{ScaleRole, ScaleTarget, ScaleValue};

use super::{applier_for, cancel_on_interrupt, load_settings, recorded_cluster, report};
use crate::{GlobalArgs, Result};

/// Host group selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Masters,
    Nodes,
}

impl From<Role> for ScaleRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Masters => ScaleRole::Masters,
            Role::Nodes => ScaleRole::Nodes,
        }
    }
}

/// Scale masters or nodes.
#[derive(Args, Debug)]
pub struct ScaleArgs {
    /// Group to scale.
    #[arg(value_enum)]
    pub role: Role,

    /// Target count (cloud) or comma-separated address list with ranges.
    pub value: String,

    /// Cluster name.
    #[arg(long)]
    pub cluster: String,
}

pub async fn run(global: &GlobalArgs, args: ScaleArgs) -> Result<()> {
    let settings = load_settings(global)?;
    let value: ScaleValue = args.value.parse()?;
    let target = ScaleTarget::new(args.role.into(), value);

    let recorded = recorded_cluster(&settings, &args.cluster)?;
    let applier = applier_for(&recorded, settings, cancel_on_interrupt());
    let plan = applier.scale(&args.cluster, &target).await?;
    report(&args.cluster, &plan);
    Ok(())
}
