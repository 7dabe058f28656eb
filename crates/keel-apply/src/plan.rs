//! Reconciliation planning.
//!
//! The desired document and the observed cluster are folded into one
//! [`Reconciliation`] up front, then expanded into an ordered [`Plan`].
//! Planning is pure: the same inputs always give the same plan.

use std::fmt;
use std::net::IpAddr;

use keel_common::{diff, ClusterCurrent, ClusterSpec, Error, HostDiff, Result};

/// What kind of pass this is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconciliation {
    /// The document carries a deletion marker.
    Teardown,
    /// No cluster exists yet.
    Bootstrap {
        /// First master, initialised alone.
        master0: IpAddr,
        /// Remaining masters.
        masters: Vec<IpAddr>,
        /// All workers.
        nodes: Vec<IpAddr>,
        /// Registry host listed in neither group; it needs the rootfs too.
        registry: Option<IpAddr>,
    },
    /// A cluster is running; move it towards the document.
    Reconcile {
        /// Master joins and deletes.
        masters: HostDiff,
        /// Node joins and deletes.
        nodes: HostDiff,
        /// The cluster must be upgraded to the desired image.
        version_changed: bool,
    },
}

impl Reconciliation {
    /// Classify a pass.
    ///
    /// The deletion marker wins over everything else, then a missing cluster.
    /// `registry` is the image's registry host, consulted only for a bootstrap.
    pub fn compute(
        desired: &ClusterSpec,
        current: Option<&ClusterCurrent>,
        version_changed: bool,
        registry: Option<IpAddr>,
    ) -> Result<Self> {
        if desired.is_deleting() {
            return Ok(Reconciliation::Teardown);
        }
        Ok(match current {
            None => {
                let Some((master0, masters)) = desired.masters().split_first() else {
                    return Err(Error::validation_for_field(
                        desired.name(),
                        "spec.masters",
                        "cannot bootstrap a cluster without masters",
                    ));
                };
                Reconciliation::Bootstrap {
                    master0: *master0,
                    masters: masters.to_vec(),
                    nodes: desired.nodes().to_vec(),
                    registry: registry.filter(|r| !desired.all_hosts().contains(r)),
                }
            }
            Some(current) => Reconciliation::Reconcile {
                masters: diff(&current.masters, desired.masters()),
                nodes: diff(&current.nodes, desired.nodes()),
                version_changed,
            },
        })
    }
}

/// One step of a plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Make the image available locally.
    PullImage,
    /// Ship the image's rootfs to these hosts.
    MountRootfs(Vec<IpAddr>),
    /// Bootstrap the first master.
    InitMaster0,
    /// Join control-plane hosts.
    JoinMasters(Vec<IpAddr>),
    /// Join workers.
    JoinNodes(Vec<IpAddr>),
    /// Join, then delete, control-plane hosts.
    ApplyMasters(HostDiff),
    /// Join, then delete, workers.
    ApplyNodes(HostDiff),
    /// Rolling upgrade to the desired image.
    Upgrade,
    /// Run the image's post-install hooks.
    RunGuestHooks,
    /// Tear down every host.
    Reset,
    /// Remove the rootfs from every host.
    UnmountRootfs,
}

impl Action {
    /// Short name used in logs and spans.
    pub fn name(&self) -> &'static str {
        match self {
            Action::PullImage => "PullImage",
            Action::MountRootfs(_) => "MountRootfs",
            Action::InitMaster0 => "InitMaster0",
            Action::JoinMasters(_) => "JoinMasters",
            Action::JoinNodes(_) => "JoinNodes",
            Action::ApplyMasters(_) => "ApplyMasters",
            Action::ApplyNodes(_) => "ApplyNodes",
            Action::Upgrade => "Upgrade",
            Action::RunGuestHooks => "RunGuestHooks",
            Action::Reset => "Reset",
            Action::UnmountRootfs => "UnmountRootfs",
        }
    }

    /// Whether the action changes anything on the hosts when the cluster
    /// already matches the document.
    fn is_baseline(&self) -> bool {
        matches!(self, Action::PullImage | Action::MountRootfs(_))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::MountRootfs(ips) | Action::JoinMasters(ips) | Action::JoinNodes(ips) => {
                write!(f, "{}({})", self.name(), join_ips(ips))
            }
            Action::ApplyMasters(d) | Action::ApplyNodes(d) => write!(
                f,
                "{}(+[{}] -[{}])",
                self.name(),
                join_ips(&d.join),
                join_ips(&d.delete)
            ),
            _ => f.write_str(self.name()),
        }
    }
}

fn join_ips(ips: &[IpAddr]) -> String {
    ips.iter()
        .map(IpAddr::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Ordered actions for one pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    actions: Vec<Action>,
}

impl Plan {
    /// Plan from an explicit action list.
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    /// Expand a reconciliation into actions.
    pub fn build(reconciliation: &Reconciliation, desired: &ClusterSpec) -> Self {
        match reconciliation {
            Reconciliation::Teardown => Plan::new(vec![Action::Reset, Action::UnmountRootfs]),
            Reconciliation::Bootstrap {
                master0,
                masters,
                nodes,
                registry,
            } => {
                let mut all = vec![*master0];
                all.extend(masters);
                all.extend(nodes);
                all.extend(registry);

                let mut actions = vec![
                    Action::PullImage,
                    Action::MountRootfs(all),
                    Action::InitMaster0,
                ];
                if !masters.is_empty() {
                    actions.push(Action::JoinMasters(masters.clone()));
                }
                if !nodes.is_empty() {
                    actions.push(Action::JoinNodes(nodes.clone()));
                }
                actions.push(Action::RunGuestHooks);
                Plan::new(actions)
            }
            Reconciliation::Reconcile {
                masters,
                nodes,
                version_changed,
            } => Self::reconcile(masters, nodes, *version_changed, desired),
        }
    }

    fn reconcile(
        masters: &HostDiff,
        nodes: &HostDiff,
        version_changed: bool,
        desired: &ClusterSpec,
    ) -> Self {
        // an upgrade needs the new rootfs everywhere, otherwise only on joiners
        let mount = if version_changed {
            desired.all_hosts()
        } else {
            masters.join.iter().chain(&nodes.join).copied().collect()
        };
        let mut actions = vec![Action::PullImage, Action::MountRootfs(mount)];

        if version_changed {
            actions.push(Action::Upgrade);
        }
        if !masters.is_empty() {
            actions.push(Action::ApplyMasters(masters.clone()));
        }
        if !nodes.is_empty() {
            actions.push(Action::ApplyNodes(nodes.clone()));
        }
        if actions.iter().all(Action::is_baseline) {
            return Plan::default();
        }
        actions.push(Action::RunGuestHooks);
        Plan::new(actions)
    }

    /// Actions in execution order.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// True when there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.actions.iter().map(Action::to_string).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Classify and expand in one go.
pub fn plan(
    desired: &ClusterSpec,
    current: Option<&ClusterCurrent>,
    version_changed: bool,
    registry: Option<IpAddr>,
) -> Result<Plan> {
    let reconciliation = Reconciliation::compute(desired, current, version_changed, registry)?;
    Ok(Plan::build(&reconciliation, desired))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| ip(s)).collect()
    }

    fn spec(masters: &[&str], nodes: &[&str]) -> ClusterSpec {
        ClusterSpec::new("prod", "kubernetes:v1.22.15", ips(masters), ips(nodes))
    }

    fn current(masters: &[&str], nodes: &[&str]) -> ClusterCurrent {
        ClusterCurrent {
            masters: ips(masters),
            nodes: ips(nodes),
            image: Some("kubernetes:v1.22.15".into()),
            version: Some("v1.22.15".into()),
        }
    }

    /// Story: a deletion marker always tears down, whatever else changed.
    #[test]
    fn story_teardown_ignores_every_other_difference() {
        let mut desired = spec(&["10.0.0.1", "10.0.0.9"], &["10.0.0.10"]);
        desired.mark_deleting("2026-01-01T00:00:00Z");

        for current in [None, Some(current(&["10.0.0.1"], &[]))] {
            let plan = plan(&desired, current.as_ref(), true, None).unwrap();
            assert_eq!(plan.actions(), &[Action::Reset, Action::UnmountRootfs]);
        }
    }

    /// Story: a fresh cluster starts with init and ends with the guest hooks.
    #[test]
    fn story_bootstrap_plan_starts_with_init() {
        let desired = spec(&["10.0.0.1", "10.0.0.2", "10.0.0.3"], &["10.0.0.10"]);
        let plan = plan(&desired, None, false, None).unwrap();

        assert_eq!(
            plan.actions(),
            &[
                Action::PullImage,
                Action::MountRootfs(ips(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.10"])),
                Action::InitMaster0,
                Action::JoinMasters(ips(&["10.0.0.2", "10.0.0.3"])),
                Action::JoinNodes(ips(&["10.0.0.10"])),
                Action::RunGuestHooks,
            ]
        );
    }

    #[test]
    fn bootstrap_mounts_a_separate_registry_host() {
        let desired = spec(&["10.0.0.1"], &["10.0.0.10"]);
        let separate = plan(&desired, None, false, Some(ip("10.0.0.50"))).unwrap();
        assert_eq!(
            separate.actions()[1],
            Action::MountRootfs(ips(&["10.0.0.1", "10.0.0.10", "10.0.0.50"]))
        );

        let listed = plan(&desired, None, false, Some(ip("10.0.0.10"))).unwrap();
        assert_eq!(
            listed.actions()[1],
            Action::MountRootfs(ips(&["10.0.0.1", "10.0.0.10"]))
        );
    }

    #[test]
    fn registry_host_is_ignored_outside_bootstrap() {
        let desired = spec(&["10.0.0.1"], &["10.0.0.10", "10.0.0.11"]);
        let running = current(&["10.0.0.1"], &["10.0.0.10"]);
        let plan = plan(&desired, Some(&running), false, Some(ip("10.0.0.50"))).unwrap();
        assert_eq!(plan.actions()[1], Action::MountRootfs(ips(&["10.0.0.11"])));
    }

    #[test]
    fn single_master_bootstrap_skips_empty_joins() {
        let plan = plan(&spec(&["10.0.0.1"], &[]), None, false, None).unwrap();
        assert_eq!(
            plan.actions(),
            &[
                Action::PullImage,
                Action::MountRootfs(ips(&["10.0.0.1"])),
                Action::InitMaster0,
                Action::RunGuestHooks,
            ]
        );
    }

    #[test]
    fn bootstrap_without_masters_is_rejected() {
        let err = plan(&spec(&[], &["10.0.0.10"]), None, false, None).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    /// Story: nothing changed, nothing to do, not even guest hooks.
    #[test]
    fn story_converged_cluster_gets_an_empty_plan() {
        let desired = spec(&["10.0.0.1"], &["10.0.0.10"]);
        let plan = plan(&desired, Some(&current(&["10.0.0.1"], &["10.0.0.10"])), false, None).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn added_master_is_joined_and_mounted() {
        let desired = spec(&["10.0.0.1", "10.0.0.2"], &[]);
        let plan = plan(&desired, Some(&current(&["10.0.0.1"], &[])), false, None).unwrap();
        assert_eq!(
            plan.actions(),
            &[
                Action::PullImage,
                Action::MountRootfs(ips(&["10.0.0.2"])),
                Action::ApplyMasters(HostDiff {
                    join: ips(&["10.0.0.2"]),
                    delete: vec![],
                }),
                Action::RunGuestHooks,
            ]
        );
    }

    #[test]
    fn master_actions_precede_node_actions() {
        let desired = spec(&["10.0.0.1", "10.0.0.2"], &["10.0.0.11"]);
        let plan = plan(
            &desired,
            Some(&current(&["10.0.0.1"], &["10.0.0.10"])),
            false,
            None,
        )
        .unwrap();
        let names: Vec<&str> = plan.actions().iter().map(Action::name).collect();
        assert_eq!(
            names,
            vec!["PullImage", "MountRootfs", "ApplyMasters", "ApplyNodes", "RunGuestHooks"]
        );
        assert_eq!(
            plan.actions()[3],
            Action::ApplyNodes(HostDiff {
                join: ips(&["10.0.0.11"]),
                delete: ips(&["10.0.0.10"]),
            })
        );
    }

    #[test]
    fn version_change_upgrades_and_mounts_everywhere() {
        let desired = spec(&["10.0.0.1"], &["10.0.0.10"]);
        let plan = plan(&desired, Some(&current(&["10.0.0.1"], &["10.0.0.10"])), true, None).unwrap();
        assert_eq!(
            plan.actions(),
            &[
                Action::PullImage,
                Action::MountRootfs(ips(&["10.0.0.1", "10.0.0.10"])),
                Action::Upgrade,
                Action::RunGuestHooks,
            ]
        );
    }

    #[test]
    fn planning_is_deterministic() {
        let desired = spec(&["10.0.0.1", "10.0.0.2"], &["10.0.0.10", "10.0.0.11"]);
        let current = current(&["10.0.0.1"], &["10.0.0.12"]);
        assert_eq!(
            plan(&desired, Some(&current), false, None).unwrap(),
            plan(&desired, Some(&current), false, None).unwrap()
        );
    }

    #[test]
    fn plan_display_lists_targets() {
        let plan = plan(&spec(&["10.0.0.1"], &[]), None, false, None).unwrap();
        assert_eq!(
            plan.to_string(),
            "[PullImage, MountRootfs(10.0.0.1), InitMaster0, RunGuestHooks]"
        );
    }
}
