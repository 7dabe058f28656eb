//! Observed membership from the running cluster's node list.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use keel_common::{ClusterCurrent, ClusterSpec, Error, Result, RuntimeFlavor};
use keel_runtime::{k0s, kubeadm};
use keel_ssh::RemoteExecutor;

use crate::collaborators::ClusterObserver;

const CONTROL_PLANE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<Node>,
}

#[derive(Debug, Deserialize)]
struct Node {
    #[serde(default)]
    metadata: NodeMeta,
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Debug, Default, Deserialize)]
struct NodeMeta {
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeStatus {
    #[serde(default)]
    addresses: Vec<NodeAddress>,
    #[serde(default)]
    node_info: NodeInfo,
}

#[derive(Debug, Deserialize)]
struct NodeAddress {
    #[serde(rename = "type")]
    kind: String,
    address: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeInfo {
    #[serde(default)]
    kubelet_version: String,
}

impl Node {
    fn internal_ip(&self) -> Option<IpAddr> {
        self.status
            .addresses
            .iter()
            .find(|a| a.kind == "InternalIP")
            .and_then(|a| a.address.parse().ok())
    }

    fn is_control_plane(&self) -> bool {
        CONTROL_PLANE_LABELS
            .iter()
            .any(|l| self.metadata.labels.contains_key(*l))
    }
}

/// Order observed hosts the way the record lists them, unknown hosts last.
fn in_record_order(mut observed: Vec<IpAddr>, recorded: &[IpAddr]) -> Vec<IpAddr> {
    observed.sort_by_key(|ip| {
        recorded
            .iter()
            .position(|r| r == ip)
            .unwrap_or(usize::MAX)
    });
    observed
}

/// Build the observed state from `kubectl get nodes -o json`.
///
/// k0s controllers do not register as nodes, so for that flavor the
/// recorded masters stand in for the control plane.
pub fn parse_nodes(raw: &str, recorded: &ClusterSpec) -> Result<ClusterCurrent> {
    let list: NodeList =
        serde_json::from_str(raw).map_err(|e| Error::parse("kubectl get nodes", e.to_string()))?;

    let mut masters = Vec::new();
    let mut nodes = Vec::new();
    let mut versions = BTreeMap::new();
    for node in &list.items {
        let Some(ip) = node.internal_ip() else {
            warn!("node without an InternalIP address, ignoring");
            continue;
        };
        versions.insert(ip, node.status.node_info.kubelet_version.clone());
        if node.is_control_plane() {
            masters.push(ip);
        } else {
            nodes.push(ip);
        }
    }

    if recorded.spec.runtime == RuntimeFlavor::K0s {
        masters = recorded.masters().to_vec();
        nodes.retain(|ip| !masters.contains(ip));
    }

    let masters = in_record_order(masters, recorded.masters());
    let nodes = in_record_order(nodes, recorded.nodes());
    let version = masters
        .first()
        .and_then(|ip| versions.get(ip))
        .or_else(|| versions.values().next())
        .filter(|v| !v.is_empty())
        .cloned();

    Ok(ClusterCurrent {
        masters,
        nodes,
        image: Some(recorded.spec.image.clone()),
        version,
    })
}

/// [`ClusterObserver`] that asks master0's API server.
pub struct KubectlObserver {
    exec: Arc<dyn RemoteExecutor>,
}

impl KubectlObserver {
    /// Observer over `exec`.
    pub fn new(exec: Arc<dyn RemoteExecutor>) -> Self {
        Self { exec }
    }
}

#[async_trait]
impl ClusterObserver for KubectlObserver {
    async fn observe(&self, recorded: &ClusterSpec) -> Result<Option<ClusterCurrent>> {
        let Some(master0) = recorded.master0() else {
            return Ok(None);
        };
        let (admin_conf, kubectl) = match recorded.spec.runtime {
            RuntimeFlavor::Kubeadm => (kubeadm::ADMIN_CONF, kubeadm::KUBECTL),
            RuntimeFlavor::K0s => (k0s::ADMIN_CONF, k0s::KUBECTL),
        };
        if !self.exec.exists(master0, admin_conf).await? {
            debug!(cluster = %recorded.name(), master0 = %master0, "cluster was never initialised");
            return Ok(None);
        }

        let raw = self
            .exec
            .cmd(master0, &format!("{kubectl} get nodes -o json"))
            .await?;
        let current = parse_nodes(&raw, recorded)?;
        debug!(
            cluster = %recorded.name(),
            masters = current.masters.len(),
            nodes = current.nodes.len(),
            "observed cluster"
        );
        Ok(Some(current))
    }
}

#[cfg(test)]
mod tests {
    use keel_ssh::testing::ScriptedExecutor;

    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn node(ip: &str, control_plane: bool, version: &str) -> String {
        let labels = if control_plane {
            r#"{"node-role.kubernetes.io/control-plane": ""}"#
        } else {
            "{}"
        };
        format!(
            r#"{{"metadata": {{"name": "n-{ip}", "labels": {labels}}},
                "status": {{"addresses": [{{"type": "Hostname", "address": "n"}},
                                          {{"type": "InternalIP", "address": "{ip}"}}],
                           "nodeInfo": {{"kubeletVersion": "{version}"}}}}}}"#
        )
    }

    fn list(nodes: &[String]) -> String {
        format!(r#"{{"kind": "NodeList", "items": [{}]}}"#, nodes.join(","))
    }

    fn recorded() -> ClusterSpec {
        ClusterSpec::new(
            "prod",
            "kubernetes:v1.22.15",
            vec![ip("10.0.0.1"), ip("10.0.0.2")],
            vec![ip("10.0.0.10")],
        )
    }

    #[test]
    fn nodes_are_split_by_role_in_record_order() {
        let raw = list(&[
            node("10.0.0.10", false, "v1.22.15"),
            node("10.0.0.2", true, "v1.22.15"),
            node("10.0.0.1", true, "v1.21.14"),
        ]);
        let current = parse_nodes(&raw, &recorded()).unwrap();
        assert_eq!(current.masters, vec![ip("10.0.0.1"), ip("10.0.0.2")]);
        assert_eq!(current.nodes, vec![ip("10.0.0.10")]);
        assert_eq!(current.version.as_deref(), Some("v1.21.14"));
        assert_eq!(current.image.as_deref(), Some("kubernetes:v1.22.15"));
    }

    #[test]
    fn k0s_controllers_come_from_the_record() {
        let mut spec = recorded();
        spec.spec.runtime = RuntimeFlavor::K0s;
        let raw = list(&[node("10.0.0.10", false, "v1.27.4+k0s")]);

        let current = parse_nodes(&raw, &spec).unwrap();
        assert_eq!(current.masters, vec![ip("10.0.0.1"), ip("10.0.0.2")]);
        assert_eq!(current.nodes, vec![ip("10.0.0.10")]);
        assert_eq!(current.version.as_deref(), Some("v1.27.4+k0s"));
    }

    #[test]
    fn garbage_output_is_a_parse_error() {
        let err = parse_nodes("The connection to the server was refused", &recorded()).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[tokio::test]
    async fn uninitialised_cluster_observes_nothing() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on("if [ -e", "no");
        let observer = KubectlObserver::new(exec.clone());

        assert_eq!(observer.observe(&recorded()).await.unwrap(), None);
        assert!(exec.hosts_running("get nodes").is_empty());
    }

    /// Story: a node that joined outside the record still shows up, after
    /// the recorded ones.
    #[tokio::test]
    async fn story_observer_reports_live_members() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on("if [ -e", "yes").on(
            "get nodes -o json",
            &list(&[
                node("10.0.0.11", false, "v1.22.15"),
                node("10.0.0.1", true, "v1.22.15"),
                node("10.0.0.10", false, "v1.22.15"),
            ]),
        );
        let observer = KubectlObserver::new(exec.clone());

        let current = observer.observe(&recorded()).await.unwrap().unwrap();
        assert_eq!(current.masters, vec![ip("10.0.0.1")]);
        assert_eq!(current.nodes, vec![ip("10.0.0.10"), ip("10.0.0.11")]);
        assert_eq!(exec.hosts_running("get nodes"), vec![ip("10.0.0.1")]);
    }
}
