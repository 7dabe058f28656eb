//! Seams to the systems around the reconciler.
//!
//! Image storage, rootfs distribution, guest hooks, plugins, host
//! provisioning and cluster observation are all behind traits so the
//! pipeline can be driven with mocks. Default implementations live in the
//! sibling modules.

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use keel_common::{ClusterCurrent, ClusterSpec, Result};
use keel_runtime::metadata::ImageMetadata;
use keel_runtime::registry::RegistryConfig;

/// Local image availability.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImagePuller: Send + Sync {
    /// Fetch the image unless it is already present.
    async fn pull_if_not_exist(&self, image: &str) -> Result<()>;

    /// Metadata shipped with a locally present image, if any.
    async fn metadata(&self, image: &str) -> Result<Option<ImageMetadata>>;

    /// Registry settings shipped with a locally present image; defaults when absent.
    async fn registry(&self, image: &str) -> Result<RegistryConfig>;
}

/// Distribution of the image's rootfs to hosts.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RootfsMounter: Send + Sync {
    /// Make the rootfs available on `hosts`; hosts that already have it are skipped.
    async fn mount(&self, cluster: &ClusterSpec, hosts: &[IpAddr]) -> Result<()>;

    /// Remove the rootfs from every host of the cluster.
    async fn unmount(&self, cluster: &ClusterSpec) -> Result<()>;
}

/// Post-install hooks baked into the image.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GuestCommandRunner: Send + Sync {
    /// Run the hooks against a freshly changed cluster.
    async fn apply(&self, cluster: &ClusterSpec) -> Result<()>;
}

/// Lifecycle extension points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Before the first master is initialised.
    PreInit,
    /// Before the guest hooks.
    PreInstall,
    /// After the guest hooks.
    PostInstall,
    /// Before teardown.
    PreClean,
    /// After teardown, while the rootfs is still mounted.
    PostClean,
}

impl Phase {
    /// Script name stem.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::PreInit => "pre-init",
            Phase::PreInstall => "pre-install",
            Phase::PostInstall => "post-install",
            Phase::PreClean => "pre-clean",
            Phase::PostClean => "post-clean",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plugin hooks run at lifecycle phases.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PluginHookRunner: Send + Sync {
    /// Run every plugin registered for `phase`.
    async fn run(&self, cluster: &ClusterSpec, phase: Phase) -> Result<()>;
}

/// Turns a document's host counts into concrete addresses.
pub trait Provisioner: Send + Sync {
    /// Resolve `desired` against the last recorded document.
    fn resolve(&self, desired: ClusterSpec, previous: Option<&ClusterSpec>) -> Result<ClusterSpec>;
}

/// Live view of a running cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterObserver: Send + Sync {
    /// Observe the cluster recorded by `recorded`; `None` when it never came up.
    async fn observe(&self, recorded: &ClusterSpec) -> Result<Option<ClusterCurrent>>;
}
