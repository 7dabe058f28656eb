//! The lifecycle contract shared by every runtime flavor.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use keel_common::settings::Settings;
use keel_common::{Result, RuntimeFlavor};
use keel_ssh::{CancellationToken, RemoteExecutor};

use crate::context::RuntimeContext;
use crate::k0s::K0sRuntime;
use crate::kubeadm::KubeadmRuntime;

/// Cluster lifecycle operations.
///
/// Every operation consumes the context it was given and returns the one
/// the next step should see. Membership in the returned context reflects
/// what actually happened: a host that failed to join is not in it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    /// Which flavor this is.
    fn flavor(&self) -> RuntimeFlavor;

    /// Bootstrap the first master.
    async fn init(&self, ctx: RuntimeContext) -> Result<RuntimeContext>;

    /// Add control-plane members, one at a time.
    async fn join_masters(&self, ctx: RuntimeContext, ips: &[IpAddr]) -> Result<RuntimeContext>;

    /// Add workers, concurrently.
    async fn join_nodes(&self, ctx: RuntimeContext, ips: &[IpAddr]) -> Result<RuntimeContext>;

    /// Remove control-plane members, one at a time.
    async fn delete_masters(&self, ctx: RuntimeContext, ips: &[IpAddr])
        -> Result<RuntimeContext>;

    /// Remove workers, concurrently.
    async fn delete_nodes(&self, ctx: RuntimeContext, ips: &[IpAddr]) -> Result<RuntimeContext>;

    /// Rolling upgrade of every host in the context to the context's version.
    async fn upgrade(&self, ctx: RuntimeContext) -> Result<RuntimeContext>;

    /// Tear down every host in the context.
    async fn reset(&self, ctx: RuntimeContext) -> Result<RuntimeContext>;
}

/// Runtime for a cluster's flavor.
pub fn runtime_for(
    flavor: RuntimeFlavor,
    exec: Arc<dyn RemoteExecutor>,
    settings: Settings,
    cancel: CancellationToken,
) -> keel_common::Result<Arc<dyn ClusterRuntime>> {
    Ok(match flavor {
        RuntimeFlavor::Kubeadm => Arc::new(KubeadmRuntime::new(exec, settings, cancel)?),
        RuntimeFlavor::K0s => Arc::new(K0sRuntime::new(exec, settings, cancel)?),
    })
}

#[cfg(test)]
mod tests {
    use keel_ssh::testing::ScriptedExecutor;

    use super::*;

    #[test]
    fn flavor_selects_backend() {
        let exec: Arc<dyn RemoteExecutor> = Arc::new(ScriptedExecutor::new());
        for flavor in [RuntimeFlavor::Kubeadm, RuntimeFlavor::K0s] {
            let runtime =
                runtime_for(flavor, exec.clone(), Settings::default(), CancellationToken::new())
                    .unwrap();
            assert_eq!(runtime.flavor(), flavor);
        }
    }
}
