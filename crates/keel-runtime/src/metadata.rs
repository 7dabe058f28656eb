//! Image metadata shipped inside the rootfs.

use std::net::IpAddr;

use serde::Deserialize;
use tracing::debug;

use keel_common::{Error, Result};
use keel_ssh::RemoteExecutor;

use crate::context::RuntimeContext;
use crate::version::KubeVersion;

/// File name of the metadata document at the rootfs root.
pub const METADATA_FILE: &str = "Metadata";

/// Contents of `<rootfs>/Metadata`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ImageMetadata {
    /// Image's own version.
    pub version: Option<String>,
    /// CPU architecture.
    pub arch: Option<String>,
    /// Free-form variant (for example `alpine`).
    pub variant: Option<String>,
    /// Kubernetes version the image installs.
    pub kube_version: Option<String>,
}

impl ImageMetadata {
    /// Parse the JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::parse(METADATA_FILE, e.to_string()))
    }

    /// Kubernetes version, preferring `kubeVersion` over `version`.
    pub fn kube_version(&self) -> Option<KubeVersion> {
        self.kube_version
            .as_deref()
            .or(self.version.as_deref())
            .and_then(|v| v.parse().ok())
    }
}

/// Resolve the version to install: the rootfs metadata on `host` when
/// present, otherwise the image tag.
pub async fn resolve_version(
    exec: &dyn RemoteExecutor,
    host: IpAddr,
    ctx: &RuntimeContext,
) -> Result<KubeVersion> {
    let path = ctx.rootfs_path(METADATA_FILE);
    let raw = exec
        .cmd(host, &format!("cat {path} 2>/dev/null || true"))
        .await?;

    if !raw.trim().is_empty() {
        if let Some(version) = ImageMetadata::from_json(&raw)?.kube_version() {
            debug!(host = %host, version = %version, "version from image metadata");
            return Ok(version);
        }
    }

    let image = &ctx.cluster().spec.image;
    KubeVersion::from_image(image).ok_or_else(|| {
        Error::validation_for_field(
            ctx.cluster().name(),
            "spec.image",
            format!("cannot determine kubernetes version: no metadata in rootfs and image '{image}' has no version tag"),
        )
    })
}
