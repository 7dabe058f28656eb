//! Rolling upgrade orchestration.
//!
//! One host at a time: drain, upgrade, restart, wait for Ready, uncordon.
//! Only masters are drained and uncordoned. The bootstrap master goes first
//! and a failure there aborts the upgrade; failures on any later host are
//! collected and reported together once every remaining host has been tried.

use std::net::IpAddr;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use keel_common::error::HostFailure;
use keel_common::retry::{retry_with_backoff, RetryConfig};
use keel_common::{Error, Result};

/// Position of a host in the upgrade order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Bootstrap master; upgrades the control plane itself.
    Master0,
    /// Any other master.
    Master,
    /// Worker.
    Node,
}

impl Role {
    /// Masters are cordoned around their upgrade, workers are not.
    pub fn is_master(self) -> bool {
        matches!(self, Role::Master0 | Role::Master)
    }
}

/// Flavor-specific steps of a single host upgrade.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostUpgrade: Send + Sync {
    /// Evict workloads and cordon.
    async fn drain(&self, host: IpAddr) -> Result<()>;

    /// Replace binaries and run the flavor's upgrade command.
    async fn upgrade(&self, host: IpAddr, role: Role) -> Result<()>;

    /// Restart the node agent.
    async fn restart(&self, host: IpAddr) -> Result<()>;

    /// Whether the host's node object reports Ready.
    async fn ready(&self, host: IpAddr) -> Result<bool>;

    /// Make the host schedulable again.
    async fn uncordon(&self, host: IpAddr) -> Result<()>;
}

/// Upgrade one host and wait for it to come back.
pub async fn upgrade_host(
    steps: &dyn HostUpgrade,
    host: IpAddr,
    role: Role,
    poll: &RetryConfig,
) -> Result<()> {
    info!(host = %host, role = ?role, "upgrading host");
    if role.is_master() {
        steps.drain(host).await?;
    }
    steps.upgrade(host, role).await?;
    steps.restart(host).await?;

    retry_with_backoff(poll, &format!("ready {host}"), move || async move {
        match steps.ready(host).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::NodeNotReady {
                host: host.to_string(),
                polls: poll.max_attempts,
            }),
            Err(e) => Err(e),
        }
    })
    .await
    .map_err(|_| Error::NodeNotReady {
        host: host.to_string(),
        polls: poll.max_attempts,
    })?;

    if role.is_master() {
        steps.uncordon(host).await?;
    }
    info!(host = %host, "host upgraded");
    Ok(())
}

/// Upgrade master0, then the other masters, then the nodes.
pub async fn rolling_upgrade(
    steps: &dyn HostUpgrade,
    masters: &[IpAddr],
    nodes: &[IpAddr],
    poll: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some((&master0, rest)) = masters.split_first() else {
        return Err(Error::validation("upgrade needs at least one master"));
    };

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    upgrade_host(steps, master0, Role::Master0, poll).await?;

    let order = rest
        .iter()
        .map(|&m| (m, Role::Master))
        .chain(nodes.iter().map(|&n| (n, Role::Node)));

    let mut failures = Vec::new();
    for (host, role) in order {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Err(e) = upgrade_host(steps, host, role, poll).await {
            error!(host = %host, error = %e, "host upgrade failed, continuing");
            failures.push(HostFailure {
                host: host.to_string(),
                message: e.to_string(),
            });
        }
    }

    match Error::partial(failures) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
