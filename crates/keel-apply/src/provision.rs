//! Count to address resolution.
//!
//! Machines are created elsewhere. For count-driven providers the desired
//! count is resolved against the addresses already on record: shrinking
//! keeps the first `count` hosts, growing needs addresses that some IaaS
//! layer has already filled in.

use std::net::IpAddr;

use tracing::debug;

use keel_common::{ClusterSpec, Error, Hosts, Result};

use crate::collaborators::Provisioner;

/// [`Provisioner`] that never creates machines.
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticProvisioner;

impl Provisioner for StaticProvisioner {
    fn resolve(&self, mut desired: ClusterSpec, previous: Option<&ClusterSpec>) -> Result<ClusterSpec> {
        if !desired.spec.provider.count_authoritative() || desired.is_deleting() {
            return Ok(desired);
        }

        let name = desired.name().to_string();
        let masters = previous.map(|p| p.masters().to_vec()).unwrap_or_default();
        let nodes = previous.map(|p| p.nodes().to_vec()).unwrap_or_default();

        resolve_group(&name, "spec.masters.count", &mut desired.spec.masters, masters)?;
        resolve_group(&name, "spec.nodes.count", &mut desired.spec.nodes, nodes)?;
        Ok(desired)
    }
}

fn resolve_group(cluster: &str, field: &str, hosts: &mut Hosts, recorded: Vec<IpAddr>) -> Result<()> {
    let Some(count) = hosts.count else {
        return Ok(());
    };
    let mut available = if hosts.ip_list.is_empty() {
        recorded
    } else {
        std::mem::take(&mut hosts.ip_list)
    };

    let wanted = count as usize;
    if wanted > available.len() {
        return Err(Error::validation_for_field(
            cluster,
            field,
            format!(
                "count {count} exceeds the {} provisioned addresses; create the machines first",
                available.len()
            ),
        ));
    }
    available.truncate(wanted);
    debug!(cluster, field, count, "resolved host count");
    hosts.ip_list = available;
    Ok(())
}

#[cfg(test)]
mod tests {
    use keel_common::{diff, ProviderKind};

    use super::*;

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn cloud(masters: &[&str], nodes: &[&str]) -> ClusterSpec {
        let mut spec = ClusterSpec::new("prod", "kubernetes:v1.22.15", ips(masters), ips(nodes));
        spec.spec.provider = ProviderKind::Cloud;
        spec
    }

    #[test]
    fn static_providers_pass_through() {
        let desired = ClusterSpec::new("prod", "kubernetes:v1.22.15", ips(&["10.0.0.1"]), vec![]);
        let resolved = StaticProvisioner.resolve(desired.clone(), None).unwrap();
        assert_eq!(resolved, desired);
    }

    /// Story: shrinking a three-master cloud cluster to one master yields
    /// exactly two removals.
    #[test]
    fn story_count_scale_down_yields_deletes() {
        let previous = cloud(&["10.0.0.1", "10.0.0.2", "10.0.0.3"], &[]);
        let mut desired = cloud(&[], &[]);
        desired.spec.masters.count = Some(1);

        let resolved = StaticProvisioner.resolve(desired, Some(&previous)).unwrap();

        assert_eq!(resolved.masters(), ips(&["10.0.0.1"]).as_slice());
        let changes = diff(previous.masters(), resolved.masters());
        assert!(changes.join.is_empty());
        assert_eq!(changes.delete, ips(&["10.0.0.2", "10.0.0.3"]));
    }

    #[test]
    fn scale_up_without_addresses_is_rejected() {
        let previous = cloud(&["10.0.0.1"], &[]);
        let mut desired = cloud(&[], &[]);
        desired.spec.masters.count = Some(3);

        let err = StaticProvisioner.resolve(desired, Some(&previous)).unwrap_err();
        assert!(err.to_string().contains("count 3 exceeds the 1"));
    }

    #[test]
    fn provided_addresses_win_over_record() {
        let previous = cloud(&["10.0.0.1"], &["10.0.0.10"]);
        let mut desired = cloud(&["10.0.0.1"], &["10.0.0.10", "10.0.0.11"]);
        desired.spec.nodes.count = Some(2);

        let resolved = StaticProvisioner.resolve(desired, Some(&previous)).unwrap();
        assert_eq!(resolved.nodes(), ips(&["10.0.0.10", "10.0.0.11"]).as_slice());
    }

    #[test]
    fn groups_without_count_are_untouched() {
        let desired = cloud(&["10.0.0.1"], &["10.0.0.10"]);
        let resolved = StaticProvisioner.resolve(desired.clone(), None).unwrap();
        assert_eq!(resolved, desired);
    }
}
