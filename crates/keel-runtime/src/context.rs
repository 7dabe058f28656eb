//! Per-pass runtime context.
//!
//! A `RuntimeContext` is built once per apply/delete call and threaded
//! through the lifecycle steps by value. Each step returns the context the
//! next step should see; nothing is filled in behind the caller's back.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keel_common::cluster::ClusterSpec;
use keel_common::settings::Settings;
use keel_common::{Error, Result, API_SERVER_DOMAIN, DEFAULT_VIP};

use crate::version::KubeVersion;

/// Credentials a new host needs to join.
///
/// `Debug` never prints the secrets themselves.
#[derive(Clone, PartialEq, Eq)]
pub enum JoinCredentials {
    /// kubeadm bootstrap token material.
    Kubeadm {
        /// `abcdef.0123456789abcdef`
        token: String,
        /// `sha256:<hex>` of the CA public key.
        discovery_hash: String,
        /// Decrypts uploaded control-plane certs; absent for worker-only joins.
        certificate_key: Option<String>,
    },
    /// k0s join tokens.
    K0s {
        /// Token for additional controllers.
        controller_token: String,
        /// Token for workers.
        worker_token: String,
    },
}

impl JoinCredentials {
    /// Whether control-plane joins can use these credentials.
    pub fn can_join_control_plane(&self) -> bool {
        match self {
            JoinCredentials::Kubeadm {
                certificate_key, ..
            } => certificate_key.is_some(),
            JoinCredentials::K0s { .. } => true,
        }
    }
}

impl fmt::Debug for JoinCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinCredentials::Kubeadm {
                token,
                discovery_hash,
                certificate_key,
            } => f
                .debug_struct("Kubeadm")
                .field("token_id", &token.split('.').next().unwrap_or(""))
                .field("discovery_hash", discovery_hash)
                .field("certificate_key", &certificate_key.as_ref().map(|_| "[REDACTED]"))
                .finish(),
            JoinCredentials::K0s { .. } => f
                .debug_struct("K0s")
                .field("controller_token", &"[REDACTED]")
                .field("worker_token", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Everything a lifecycle step needs to know about this pass.
#[derive(Clone, Debug)]
pub struct RuntimeContext {
    cluster: Arc<ClusterSpec>,
    rootfs: String,
    local_dir: PathBuf,
    vip: IpAddr,
    master0: Option<IpAddr>,
    masters: Vec<IpAddr>,
    nodes: Vec<IpAddr>,
    credentials: Option<JoinCredentials>,
    version: Option<KubeVersion>,
}

impl RuntimeContext {
    /// Fresh context with the given live membership.
    pub fn new(
        cluster: Arc<ClusterSpec>,
        settings: &Settings,
        masters: Vec<IpAddr>,
        nodes: Vec<IpAddr>,
    ) -> Self {
        let rootfs = settings
            .rootfs_dir(cluster.name())
            .to_string_lossy()
            .into_owned();
        let local_dir = settings.cluster_state_dir(cluster.name());
        Self {
            cluster,
            rootfs,
            local_dir,
            vip: default_vip(),
            master0: None,
            masters,
            nodes,
            credentials: None,
            version: None,
        }
    }

    /// Desired cluster document.
    pub fn cluster(&self) -> &ClusterSpec {
        &self.cluster
    }

    /// Remote rootfs directory.
    pub fn rootfs(&self) -> &str {
        &self.rootfs
    }

    /// Remote path under the rootfs.
    pub fn rootfs_path(&self, rel: &str) -> String {
        format!("{}/{}", self.rootfs.trim_end_matches('/'), rel)
    }

    /// Local state directory (PKI, kubeconfigs, rendered configs).
    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    /// Virtual IP for worker-side API access.
    pub fn vip(&self) -> IpAddr {
        self.vip
    }

    /// Bootstrap master of this pass.
    ///
    /// A pinned master0 wins. Otherwise the document's first master is used
    /// while it is live (or nothing is live yet), else the first live master,
    /// so a newly listed host never stands in for the running control plane.
    pub fn master0(&self) -> Option<IpAddr> {
        if let Some(master0) = self.master0 {
            return Some(master0);
        }
        match (self.cluster.master0(), self.masters.first()) {
            (Some(head), _) if self.masters.is_empty() || self.masters.contains(&head) => {
                Some(head)
            }
            (_, Some(live)) => Some(*live),
            (head, None) => head,
        }
    }

    /// Bootstrap master, or a validation error for a document without masters.
    pub fn require_master0(&self) -> Result<IpAddr> {
        self.master0().ok_or_else(|| {
            Error::validation_for_field(self.cluster.name(), "spec.masters", "cluster has no masters")
        })
    }

    /// Masters currently in the cluster.
    pub fn masters(&self) -> &[IpAddr] {
        &self.masters
    }

    /// Nodes currently in the cluster.
    pub fn nodes(&self) -> &[IpAddr] {
        &self.nodes
    }

    /// Credentials obtained earlier in this pass.
    pub fn credentials(&self) -> Option<&JoinCredentials> {
        self.credentials.as_ref()
    }

    /// Version running (or being installed) in this pass.
    pub fn version(&self) -> Option<KubeVersion> {
        self.version
    }

    /// API server SANs: loopback, VIP, API domain, masters, then configured extras.
    pub fn cert_sans(&self) -> Vec<String> {
        let mut sans = vec![
            "127.0.0.1".to_string(),
            "localhost".to_string(),
            self.vip.to_string(),
            API_SERVER_DOMAIN.to_string(),
        ];
        sans.extend(self.cluster.masters().iter().map(IpAddr::to_string));
        sans.extend(self.cluster.spec.cert_sans.iter().cloned());
        let mut seen = std::collections::HashSet::new();
        sans.retain(|s| seen.insert(s.clone()));
        sans
    }

    /// Same context with master0 fixed, typically to the recorded one.
    pub fn with_master0(mut self, master0: IpAddr) -> Self {
        self.master0 = Some(master0);
        self
    }

    /// Same context with credentials set.
    pub fn with_credentials(mut self, credentials: JoinCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Same context with a version set.
    pub fn with_version(mut self, version: KubeVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Same context with hosts added to the masters.
    pub fn with_masters_joined(mut self, ips: &[IpAddr]) -> Self {
        self.settle_master0();
        extend_unique(&mut self.masters, ips);
        self
    }

    /// Same context with hosts added to the nodes.
    pub fn with_nodes_joined(mut self, ips: &[IpAddr]) -> Self {
        extend_unique(&mut self.nodes, ips);
        self
    }

    /// Same context with hosts removed from the masters.
    pub fn with_masters_removed(mut self, ips: &[IpAddr]) -> Self {
        self.settle_master0();
        self.masters.retain(|m| !ips.contains(m));
        self
    }

    /// Same context with hosts removed from the nodes.
    pub fn with_nodes_removed(mut self, ips: &[IpAddr]) -> Self {
        self.nodes.retain(|n| !ips.contains(n));
        self
    }

    // Once a control plane is live, membership changes must not move master0.
    fn settle_master0(&mut self) {
        if self.master0.is_none() && !self.masters.is_empty() {
            self.master0 = self.master0();
        }
    }

    /// Same context with an empty membership.
    pub fn emptied(mut self) -> Self {
        self.masters.clear();
        self.nodes.clear();
        self.credentials = None;
        self
    }
}

fn extend_unique(list: &mut Vec<IpAddr>, ips: &[IpAddr]) {
    for ip in ips {
        if !list.contains(ip) {
            list.push(*ip);
        }
    }
}

fn default_vip() -> IpAddr {
    DEFAULT_VIP
        .parse()
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::new(10, 103, 97, 2)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn ctx() -> RuntimeContext {
        let mut spec = ClusterSpec::new(
            "prod",
            "kubernetes:v1.22.15",
            vec![ip("10.0.0.1"), ip("10.0.0.2")],
            vec![ip("10.0.0.10")],
        );
        spec.spec.cert_sans = vec!["api.example.com".into(), "10.0.0.1".into()];
        let settings = Settings {
            state_dir: "/home/op/.keel".into(),
            ..Default::default()
        };
        RuntimeContext::new(Arc::new(spec), &settings, vec![], vec![])
    }

    #[test]
    fn paths_derive_from_settings() {
        let ctx = ctx();
        assert_eq!(ctx.rootfs(), "/var/lib/keel/prod/rootfs");
        assert_eq!(
            ctx.rootfs_path("scripts/init.sh"),
            "/var/lib/keel/prod/rootfs/scripts/init.sh"
        );
        assert_eq!(ctx.local_dir(), Path::new("/home/op/.keel/prod"));
        assert_eq!(ctx.vip(), ip("10.103.97.2"));
    }

    #[test]
    fn sans_cover_loopback_vip_masters_and_extras_once() {
        let sans = ctx().cert_sans();
        assert_eq!(sans[0], "127.0.0.1");
        assert!(sans.contains(&"10.103.97.2".to_string()));
        assert!(sans.contains(&"10.0.0.2".to_string()));
        assert!(sans.contains(&"api.example.com".to_string()));
        assert_eq!(sans.iter().filter(|s| *s == "10.0.0.1").count(), 1);
    }

    /// Story: each step hands the next one an updated view of the cluster.
    #[test]
    fn story_membership_flows_through_steps() {
        let ctx = ctx()
            .with_masters_joined(&[ip("10.0.0.1")])
            .with_masters_joined(&[ip("10.0.0.2"), ip("10.0.0.1")])
            .with_nodes_joined(&[ip("10.0.0.10")]);
        assert_eq!(ctx.masters(), &[ip("10.0.0.1"), ip("10.0.0.2")]);

        let ctx = ctx.with_masters_removed(&[ip("10.0.0.2")]);
        assert_eq!(ctx.masters(), &[ip("10.0.0.1")]);
        assert_eq!(ctx.nodes(), &[ip("10.0.0.10")]);

        let ctx = ctx.emptied();
        assert!(ctx.masters().is_empty() && ctx.nodes().is_empty());
    }

    #[test]
    fn credential_debug_hides_secrets() {
        let creds = JoinCredentials::Kubeadm {
            token: "abcdef.0123456789abcdef".into(),
            discovery_hash: "sha256:00ff".into(),
            certificate_key: Some("deadbeef".into()),
        };
        let debug = format!("{creds:?}");
        assert!(debug.contains("abcdef"));
        assert!(!debug.contains("0123456789abcdef"));
        assert!(!debug.contains("deadbeef"));
        assert!(creds.can_join_control_plane());
    }

    /// Story: a new master listed first in the document joins through the
    /// live control plane instead of bootstrapping against itself.
    #[test]
    fn story_prepended_master_does_not_become_master0() {
        let spec = ClusterSpec::new(
            "prod",
            "kubernetes:v1.22.15",
            vec![ip("10.0.0.5"), ip("10.0.0.1")],
            vec![],
        );
        let settings = Settings::default();
        let fresh = RuntimeContext::new(Arc::new(spec), &settings, vec![], vec![]);
        assert_eq!(fresh.master0(), Some(ip("10.0.0.5")));

        let live = fresh.clone().with_masters_joined(&[ip("10.0.0.1")]);
        assert_eq!(live.master0(), Some(ip("10.0.0.1")));

        let joined = live.with_masters_joined(&[ip("10.0.0.5")]);
        assert_eq!(joined.masters(), &[ip("10.0.0.1"), ip("10.0.0.5")]);
        assert_eq!(joined.require_master0().unwrap(), ip("10.0.0.1"));

        let pinned = fresh.with_master0(ip("10.0.0.1"));
        assert_eq!(pinned.master0(), Some(ip("10.0.0.1")));
    }
}
