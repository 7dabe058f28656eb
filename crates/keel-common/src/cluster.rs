//! The cluster document: desired state as written by the operator, and the
//! observed state fetched from the running cluster.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::hosts::{self, deserialize_ip_list};
use crate::{Error, Result};

/// API version written into every persisted document.
pub const API_VERSION: &str = "keel.dev/v1";

/// Document kind.
pub const KIND: &str = "Cluster";

/// Desired cluster state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Always [`API_VERSION`].
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Always [`KIND`].
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Name and lifecycle markers.
    pub metadata: ClusterMetadata,
    /// Everything the reconciler acts on.
    pub spec: ClusterConfig,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    KIND.to_string()
}

/// Identity and lifecycle markers of a cluster.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetadata {
    /// Cluster name, used for state directories and remote paths.
    pub name: String,
    /// Set when the operator asked for the cluster to be torn down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
}

/// Spec section of the cluster document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Packaged cluster image reference.
    pub image: String,
    /// Where the hosts come from.
    #[serde(default)]
    pub provider: ProviderKind,
    /// Bootstrap tool used on the hosts.
    #[serde(default)]
    pub runtime: RuntimeFlavor,
    /// How to reach the hosts.
    #[serde(default)]
    pub ssh: SshCredentials,
    /// Pod/service networking.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Extra subject alternative names for the API server certificate.
    #[serde(default, rename = "certSANs", skip_serializing_if = "Vec::is_empty")]
    pub cert_sans: Vec<String>,
    /// Control-plane hosts; the first one is master0.
    pub masters: Hosts,
    /// Worker hosts.
    #[serde(default)]
    pub nodes: Hosts,
    /// Replaces the built-in init configuration template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeadm_config_template: Option<PathBuf>,
}

/// Source of host addresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    /// Operator-supplied machines; `ipList` is authoritative.
    #[default]
    BareMetal,
    /// IaaS machines; `count` is authoritative and an external provisioner fills `ipList`.
    Cloud,
    /// Container-simulated hosts; addressed like bare metal.
    Container,
}

impl ProviderKind {
    /// Whether `count` rather than `ipList` drives the host groups.
    pub fn count_authoritative(self) -> bool {
        matches!(self, ProviderKind::Cloud)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::BareMetal => write!(f, "BareMetal"),
            ProviderKind::Cloud => write!(f, "Cloud"),
            ProviderKind::Container => write!(f, "Container"),
        }
    }
}

/// Bootstrap tool flavor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeFlavor {
    /// kubeadm init/join.
    #[default]
    Kubeadm,
    /// k0s controller/worker.
    K0s,
}

impl fmt::Display for RuntimeFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeFlavor::Kubeadm => write!(f, "kubeadm"),
            RuntimeFlavor::K0s => write!(f, "k0s"),
        }
    }
}

/// SSH login material.
///
/// `Debug` is implemented by hand so secrets never reach the logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshCredentials {
    /// Login user.
    #[serde(default = "default_user")]
    pub user: String,
    /// Password, used through sshpass when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passwd: Option<String>,
    /// Private key path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk: Option<PathBuf>,
    /// Private key passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk_passwd: Option<String>,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_user() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    22
}

impl Default for SshCredentials {
    fn default() -> Self {
        Self {
            user: default_user(),
            passwd: None,
            pk: None,
            pk_passwd: None,
            port: default_port(),
        }
    }
}

impl fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredentials")
            .field("user", &self.user)
            .field("passwd", &self.passwd.as_ref().map(|_| "[REDACTED]"))
            .field("pk", &self.pk)
            .field("pk_passwd", &self.pk_passwd.as_ref().map(|_| "[REDACTED]"))
            .field("port", &self.port)
            .finish()
    }
}

/// Cluster networking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Pod network CIDR.
    #[serde(default = "default_pod_cidr", rename = "podCIDR")]
    pub pod_cidr: String,
    /// Service network CIDR.
    #[serde(default = "default_svc_cidr", rename = "svcCIDR")]
    pub svc_cidr: String,
    /// CNI plugin name, informational for guest hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cni: Option<String>,
    /// Cluster DNS domain.
    #[serde(default = "default_dns_domain")]
    pub dns_domain: String,
    /// Host interface the CNI should bind to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

fn default_pod_cidr() -> String {
    "100.64.0.0/10".to_string()
}

fn default_svc_cidr() -> String {
    "10.96.0.0/22".to_string()
}

fn default_dns_domain() -> String {
    "cluster.local".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            pod_cidr: default_pod_cidr(),
            svc_cidr: default_svc_cidr(),
            cni: None,
            dns_domain: default_dns_domain(),
            interface: None,
        }
    }
}

/// A host group: a set of addresses annotated with a target size.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hosts {
    /// Target size; authoritative for count-driven providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    /// Addresses; authoritative for statically addressed providers.
    #[serde(default, deserialize_with = "deserialize_ip_list")]
    pub ip_list: Vec<IpAddr>,
}

impl Hosts {
    /// Group from a fixed address list.
    pub fn from_ips(ips: impl IntoIterator<Item = IpAddr>) -> Self {
        let ips: Vec<IpAddr> = ips.into_iter().collect();
        Self {
            count: None,
            ip_list: hosts::dedup(&ips),
        }
    }

    /// True when the group has no addresses.
    pub fn is_empty(&self) -> bool {
        self.ip_list.is_empty()
    }
}

impl ClusterSpec {
    /// Build a minimal statically-addressed cluster document.
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        masters: Vec<IpAddr>,
        nodes: Vec<IpAddr>,
    ) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ClusterMetadata {
                name: name.into(),
                deletion_timestamp: None,
            },
            spec: ClusterConfig {
                image: image.into(),
                provider: ProviderKind::default(),
                runtime: RuntimeFlavor::default(),
                ssh: SshCredentials::default(),
                network: NetworkConfig::default(),
                cert_sans: Vec::new(),
                masters: Hosts::from_ips(masters),
                nodes: Hosts::from_ips(nodes),
                kubeadm_config_template: None,
            },
        }
    }

    /// Parse a cluster document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let spec: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::serialization_for_kind(KIND, e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Render the cluster document.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::serialization_for_kind(KIND, e.to_string()))
    }

    /// Cluster name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Whether teardown was requested.
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Request teardown.
    pub fn mark_deleting(&mut self, timestamp: impl Into<String>) {
        self.metadata.deletion_timestamp = Some(timestamp.into());
    }

    /// The bootstrap master.
    ///
    /// This is the head of the master list. Documents applied to a running
    /// cluster get the recorded master0 moved there by [`Self::pin_master0`].
    pub fn master0(&self) -> Option<IpAddr> {
        self.spec.masters.ip_list.first().copied()
    }

    /// Move `master0` to the head of the master list.
    ///
    /// Host order carries no meaning otherwise, so reordering keeps the
    /// document's membership intact. Returns false when `master0` is not
    /// listed.
    pub fn pin_master0(&mut self, master0: IpAddr) -> bool {
        let list = &mut self.spec.masters.ip_list;
        match list.iter().position(|m| *m == master0) {
            Some(pos) => {
                list[..=pos].rotate_right(1);
                true
            }
            None => false,
        }
    }

    /// Control-plane addresses.
    pub fn masters(&self) -> &[IpAddr] {
        &self.spec.masters.ip_list
    }

    /// Worker addresses.
    pub fn nodes(&self) -> &[IpAddr] {
        &self.spec.nodes.ip_list
    }

    /// Masters then nodes.
    pub fn all_hosts(&self) -> Vec<IpAddr> {
        self.masters().iter().chain(self.nodes()).copied().collect()
    }

    /// Structural checks that need no knowledge of the running cluster.
    pub fn validate(&self) -> Result<()> {
        let name = self.name();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::validation_for_field(
                name,
                "metadata.name",
                "cluster name must be non-empty lowercase alphanumerics and '-'",
            ));
        }
        if self.spec.image.trim().is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.image",
                "image is required",
            ));
        }

        if self.spec.provider.count_authoritative() {
            if self.spec.masters.count == Some(0) {
                return Err(Error::validation_for_field(
                    name,
                    "spec.masters.count",
                    "master count must be at least 1",
                ));
            }
        } else if self.spec.masters.is_empty() && !self.is_deleting() {
            return Err(Error::validation_for_field(
                name,
                "spec.masters.ipList",
                "at least one master is required",
            ));
        }

        if let Some(ip) = self.masters().iter().find(|ip| self.nodes().contains(ip)) {
            return Err(Error::validation_for_field(
                name,
                "spec.nodes.ipList",
                format!("{ip} is listed as both master and node"),
            ));
        }
        Ok(())
    }
}

/// Observed state of a running cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterCurrent {
    /// Running control-plane hosts.
    pub masters: Vec<IpAddr>,
    /// Running worker hosts.
    pub nodes: Vec<IpAddr>,
    /// Image recorded by the last successful apply.
    pub image: Option<String>,
    /// Kubelet version reported by master0.
    pub version: Option<String>,
}
