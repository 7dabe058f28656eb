//! Apply, delete and scale entry points.
//!
//! One pass: load the record, resolve counts, validate, observe the live
//! cluster, plan, persist intent, execute. The record is forgotten only
//! after a teardown finishes.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{info, warn};

use keel_common::settings::Settings;
use keel_common::store::ClusterStore;
use keel_common::{ClusterCurrent, ClusterSpec, Error, Result};
use keel_runtime::{runtime_for, ClusterRuntime, KubeVersion, RuntimeContext};
use keel_ssh::{CancellationToken, RemoteExecutor};

use crate::collaborators::{
    ClusterObserver, GuestCommandRunner, ImagePuller, PluginHookRunner, Provisioner,
    RootfsMounter,
};
use crate::hooks::{ScriptGuestRunner, ScriptPluginRunner};
use crate::image::LocalImageStore;
use crate::observe::KubectlObserver;
use crate::pipeline::ActionPipeline;
use crate::plan::{plan, Plan};
use crate::provision::StaticProvisioner;
use crate::rootfs::RemoteRootfsMounter;
use crate::scale::{scaled, ScaleTarget};
use crate::validate::validate;

/// Everything the applier delegates to.
pub struct Collaborators {
    /// Lifecycle backend; picked from the document's flavor when `None`.
    pub runtime: Option<Arc<dyn ClusterRuntime>>,
    /// Local images.
    pub images: Arc<dyn ImagePuller>,
    /// Rootfs distribution.
    pub rootfs: Arc<dyn RootfsMounter>,
    /// Guest hooks.
    pub guest: Arc<dyn GuestCommandRunner>,
    /// Plugin hooks.
    pub plugins: Arc<dyn PluginHookRunner>,
    /// Live cluster view.
    pub observer: Arc<dyn ClusterObserver>,
    /// Count resolution.
    pub provisioner: Arc<dyn Provisioner>,
}

impl Collaborators {
    /// Default implementations over a remote executor.
    pub fn remote(
        exec: Arc<dyn RemoteExecutor>,
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            runtime: None,
            images: Arc::new(LocalImageStore::new(settings)),
            rootfs: Arc::new(RemoteRootfsMounter::new(
                exec.clone(),
                settings.clone(),
                cancel.clone(),
            )),
            guest: Arc::new(ScriptGuestRunner::new(exec.clone(), settings.clone())),
            plugins: Arc::new(ScriptPluginRunner::new(
                exec.clone(),
                settings.clone(),
                cancel.clone(),
            )),
            observer: Arc::new(KubectlObserver::new(exec)),
            provisioner: Arc::new(StaticProvisioner),
        }
    }
}

/// Drives clusters towards their documents.
pub struct Applier {
    settings: Settings,
    store: ClusterStore,
    exec: Arc<dyn RemoteExecutor>,
    collaborators: Collaborators,
    cancel: CancellationToken,
}

impl Applier {
    /// Applier with the default collaborators.
    pub fn new(settings: Settings, exec: Arc<dyn RemoteExecutor>, cancel: CancellationToken) -> Self {
        let collaborators = Collaborators::remote(exec.clone(), &settings, &cancel);
        Self::with_collaborators(settings, exec, collaborators, cancel)
    }

    /// Applier with explicit collaborators.
    pub fn with_collaborators(
        settings: Settings,
        exec: Arc<dyn RemoteExecutor>,
        collaborators: Collaborators,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store: ClusterStore::new(&settings.state_dir),
            settings,
            exec,
            collaborators,
            cancel,
        }
    }

    /// Record of a cluster, if it was ever applied.
    pub fn recorded(&self, name: &str) -> Result<Option<ClusterSpec>> {
        self.store.load(name)
    }

    /// Move the cluster towards `desired`; returns the plan that ran.
    pub async fn apply(&self, desired: ClusterSpec) -> Result<Plan> {
        let name = desired.name().to_string();
        let previous = self.store.load(&name)?;
        let mut desired = self
            .collaborators
            .provisioner
            .resolve(desired, previous.as_ref())?;
        // the recorded master0 stays master0 wherever the document lists it
        let recorded_master0 = previous.as_ref().and_then(ClusterSpec::master0);
        if let Some(master0) = recorded_master0 {
            desired.pin_master0(master0);
        }
        desired.validate()?;

        let current = self.observe(&desired, previous.as_ref()).await?;
        validate(&desired, previous.as_ref(), current.as_ref())?;

        let version_changed = match &current {
            Some(current) => self.version_changed(&desired, current).await?,
            None => false,
        };
        let registry = match &current {
            None if !desired.is_deleting() => self.registry_host(&desired).await?,
            _ => None,
        };
        let plan = plan(&desired, current.as_ref(), version_changed, registry)?;
        if plan.is_empty() {
            info!(cluster = %name, "cluster already matches the document");
            self.store.save(&desired)?;
            return Ok(plan);
        }

        self.store.save(&desired)?;
        let mut ctx = self.context(&desired, previous.as_ref(), current.as_ref());
        if let Some(master0) = recorded_master0.filter(|m| ctx.masters().contains(m)) {
            ctx = ctx.with_master0(master0);
        }
        let runtime = match &self.collaborators.runtime {
            Some(runtime) => runtime.clone(),
            None => runtime_for(
                desired.spec.runtime,
                self.exec.clone(),
                self.settings.clone(),
                self.cancel.clone(),
            )?,
        };
        let pipeline = ActionPipeline::new(
            runtime,
            self.collaborators.images.clone(),
            self.collaborators.rootfs.clone(),
            self.collaborators.guest.clone(),
            self.collaborators.plugins.clone(),
            self.cancel.clone(),
        );
        pipeline.execute(&plan, ctx).await?;

        if desired.is_deleting() {
            self.store.remove(&name)?;
            info!(cluster = %name, "cluster deleted");
        } else {
            info!(cluster = %name, "cluster applied");
        }
        Ok(plan)
    }

    /// Tear down a recorded cluster.
    pub async fn delete(&self, name: &str) -> Result<Plan> {
        let mut recorded = self.require_recorded(name)?;
        recorded.mark_deleting(chrono::Utc::now().to_rfc3339());
        self.apply(recorded).await
    }

    /// Change one host group of a recorded cluster.
    pub async fn scale(&self, name: &str, target: &ScaleTarget) -> Result<Plan> {
        let recorded = self.require_recorded(name)?;
        info!(cluster = %name, role = %target.role, "scaling cluster");
        self.apply(scaled(&recorded, target)?).await
    }

    fn require_recorded(&self, name: &str) -> Result<ClusterSpec> {
        self.store.load(name)?.ok_or_else(|| {
            Error::validation_for(name, format!("no cluster named '{name}' has been applied"))
        })
    }

    async fn observe(
        &self,
        desired: &ClusterSpec,
        previous: Option<&ClusterSpec>,
    ) -> Result<Option<ClusterCurrent>> {
        let Some(recorded) = previous else {
            return Ok(None);
        };
        match self.collaborators.observer.observe(recorded).await {
            Ok(current) => Ok(current),
            Err(e) if desired.is_deleting() => {
                warn!(cluster = %desired.name(), error = %e, "cannot observe cluster, tearing down recorded hosts");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// The image changed, or the image ships a version other than the running one.
    async fn version_changed(&self, desired: &ClusterSpec, current: &ClusterCurrent) -> Result<bool> {
        if current.image.as_deref() != Some(desired.spec.image.as_str()) {
            return Ok(true);
        }
        let shipped = self
            .collaborators
            .images
            .metadata(&desired.spec.image)
            .await?
            .and_then(|m| m.kube_version());
        let running = current
            .version
            .as_deref()
            .and_then(|v| v.parse::<KubeVersion>().ok());
        Ok(matches!((shipped, running), (Some(s), Some(r)) if s != r))
    }

    /// Registry host named by the image, which must be present to read it.
    async fn registry_host(&self, desired: &ClusterSpec) -> Result<Option<IpAddr>> {
        let images = &self.collaborators.images;
        images.pull_if_not_exist(&desired.spec.image).await?;
        Ok(images.registry(&desired.spec.image).await?.ip)
    }

    /// Initial context: live membership, or the recorded hosts for a teardown
    /// of a cluster that cannot be observed.
    fn context(
        &self,
        desired: &ClusterSpec,
        previous: Option<&ClusterSpec>,
        current: Option<&ClusterCurrent>,
    ) -> RuntimeContext {
        let (cluster, masters, nodes) = match (desired.is_deleting(), current, previous) {
            (_, Some(current), _) => (
                desired.clone(),
                current.masters.clone(),
                current.nodes.clone(),
            ),
            (true, None, Some(recorded)) => {
                let mut recorded = recorded.clone();
                recorded.metadata.deletion_timestamp = desired.metadata.deletion_timestamp.clone();
                let (masters, nodes) = (recorded.masters().to_vec(), recorded.nodes().to_vec());
                (recorded, masters, nodes)
            }
            (true, None, None) => (
                desired.clone(),
                desired.masters().to_vec(),
                desired.nodes().to_vec(),
            ),
            (false, None, _) => (desired.clone(), Vec::new(), Vec::new()),
        };
        RuntimeContext::new(Arc::new(cluster), &self.settings, masters, nodes)
    }
}

#[cfg(test)]
mod tests {
    use keel_runtime::metadata::ImageMetadata;
    use keel_runtime::registry::RegistryConfig;
    use keel_ssh::testing::ScriptedExecutor;

    use super::*;
    use crate::collaborators::{
        MockClusterObserver, MockGuestCommandRunner, MockImagePuller, MockPluginHookRunner,
        MockRootfsMounter,
    };
    use crate::pipeline::tests::{recording_runtime, Log};
    use crate::plan::Action;
    use crate::scale::{ScaleRole, ScaleValue};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| ip(s)).collect()
    }

    fn spec(masters: &[&str], nodes: &[&str]) -> ClusterSpec {
        ClusterSpec::new("prod", "kubernetes:v1.22.15", ips(masters), ips(nodes))
    }

    struct Harness {
        _dir: tempfile::TempDir,
        log: Log,
        applier: Applier,
    }

    /// Applier whose observer reports `current` and whose image ships `shipped`.
    fn harness(current: Option<ClusterCurrent>, shipped: Option<&str>) -> Harness {
        harness_with_registry(current, shipped, None)
    }

    fn harness_with_registry(
        current: Option<ClusterCurrent>,
        shipped: Option<&str>,
        registry: Option<IpAddr>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let log = Log::default();

        let mut images = MockImagePuller::new();
        images.expect_pull_if_not_exist().returning(|_| Ok(()));
        let shipped = shipped.map(|v| ImageMetadata {
            kube_version: Some(v.to_string()),
            ..Default::default()
        });
        images
            .expect_metadata()
            .returning(move |_| Ok(shipped.clone()));
        let registry = registry.map(|ip| RegistryConfig {
            ip: Some(ip),
            ..Default::default()
        });
        images
            .expect_registry()
            .returning(move |_| Ok(registry.clone().unwrap_or_default()));

        let mut rootfs = MockRootfsMounter::new();
        let l = log.clone();
        rootfs.expect_mount().returning(move |_, hosts| {
            let hosts: Vec<String> = hosts.iter().map(IpAddr::to_string).collect();
            l.lock().unwrap().push(format!("mount({})", hosts.join(",")));
            Ok(())
        });
        let l = log.clone();
        rootfs.expect_unmount().returning(move |_| {
            l.lock().unwrap().push("unmount".into());
            Ok(())
        });

        let mut guest = MockGuestCommandRunner::new();
        guest.expect_apply().returning(|_| Ok(()));
        let mut plugins = MockPluginHookRunner::new();
        plugins.expect_run().returning(|_, _| Ok(()));

        let mut observer = MockClusterObserver::new();
        observer
            .expect_observe()
            .returning(move |_| Ok(current.clone()));

        let collaborators = Collaborators {
            runtime: Some(Arc::new(recording_runtime(&log))),
            images: Arc::new(images),
            rootfs: Arc::new(rootfs),
            guest: Arc::new(guest),
            plugins: Arc::new(plugins),
            observer: Arc::new(observer),
            provisioner: Arc::new(StaticProvisioner),
        };
        let applier = Applier::with_collaborators(
            settings,
            Arc::new(ScriptedExecutor::new()),
            collaborators,
            CancellationToken::new(),
        );
        Harness {
            _dir: dir,
            log,
            applier,
        }
    }

    fn running(masters: &[&str], nodes: &[&str]) -> ClusterCurrent {
        ClusterCurrent {
            masters: ips(masters),
            nodes: ips(nodes),
            image: Some("kubernetes:v1.22.15".into()),
            version: Some("v1.22.15".into()),
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    /// Story: the first apply bootstraps the cluster and records the document.
    #[tokio::test]
    async fn story_first_apply_bootstraps_and_records() {
        let h = harness(None, None);
        let desired = spec(&["10.0.0.1"], &["10.0.0.10"]);

        let plan = h.applier.apply(desired.clone()).await.unwrap();

        assert_eq!(plan.actions()[2], Action::InitMaster0);
        assert_eq!(
            entries(&h.log),
            vec!["mount(10.0.0.1,10.0.0.10)", "init", "join_nodes(10.0.0.10)"]
        );
        assert_eq!(h.applier.recorded("prod").unwrap(), Some(desired));
    }

    #[tokio::test]
    async fn bootstrap_mounts_the_image_registry_host() {
        let h = harness_with_registry(None, None, Some(ip("10.0.0.50")));

        h.applier
            .apply(spec(&["10.0.0.1"], &["10.0.0.10"]))
            .await
            .unwrap();

        assert_eq!(entries(&h.log)[0], "mount(10.0.0.1,10.0.0.10,10.0.0.50)");
    }

    #[tokio::test]
    async fn converged_cluster_does_nothing() {
        let h = harness(Some(running(&["10.0.0.1"], &["10.0.0.10"])), Some("v1.22.15"));
        let desired = spec(&["10.0.0.1"], &["10.0.0.10"]);
        h.applier.store.save(&desired).unwrap();

        let plan = h.applier.apply(desired).await.unwrap();

        assert!(plan.is_empty());
        assert!(entries(&h.log).is_empty());
    }

    #[tokio::test]
    async fn shipped_version_drift_triggers_upgrade() {
        let h = harness(Some(running(&["10.0.0.1"], &[])), Some("v1.23.17"));
        let desired = spec(&["10.0.0.1"], &[]);
        h.applier.store.save(&desired).unwrap();

        h.applier.apply(desired).await.unwrap();

        assert!(entries(&h.log).contains(&"upgrade".to_string()));
    }

    #[tokio::test]
    async fn invalid_transition_touches_nothing() {
        let h = harness(Some(running(&["10.0.0.1", "10.0.0.2"], &[])), None);
        let recorded = spec(&["10.0.0.1", "10.0.0.2"], &[]);
        h.applier.store.save(&recorded).unwrap();

        let err = h
            .applier
            .apply(spec(&["10.0.0.1", "10.0.0.3"], &[]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation { .. }));
        assert!(entries(&h.log).is_empty());
        assert_eq!(h.applier.recorded("prod").unwrap(), Some(recorded));
    }

    /// Story: a new master listed ahead of the running one joins through
    /// the recorded master0, which stays first in the record.
    #[tokio::test]
    async fn story_prepended_master_keeps_recorded_master0() {
        let h = harness(Some(running(&["10.0.0.1"], &[])), None);
        h.applier.store.save(&spec(&["10.0.0.1"], &[])).unwrap();

        h.applier
            .apply(spec(&["10.0.0.5", "10.0.0.1"], &[]))
            .await
            .unwrap();

        assert_eq!(
            entries(&h.log),
            vec!["mount(10.0.0.5)", "join_masters(10.0.0.5) via 10.0.0.1"]
        );
        let recorded = h.applier.recorded("prod").unwrap().unwrap();
        assert_eq!(recorded.master0(), Some(ip("10.0.0.1")));
        assert_eq!(recorded.masters(), ips(&["10.0.0.1", "10.0.0.5"]).as_slice());
    }

    #[tokio::test]
    async fn scale_nodes_joins_the_new_host() {
        let h = harness(Some(running(&["10.0.0.1"], &["10.0.0.10"])), None);
        h.applier.store.save(&spec(&["10.0.0.1"], &["10.0.0.10"])).unwrap();

        let target = ScaleTarget::new(
            ScaleRole::Nodes,
            "10.0.0.10,10.0.0.11".parse::<ScaleValue>().unwrap(),
        );
        h.applier.scale("prod", &target).await.unwrap();

        assert_eq!(
            entries(&h.log),
            vec!["mount(10.0.0.11)", "join_nodes(10.0.0.11)"]
        );
        let recorded = h.applier.recorded("prod").unwrap().unwrap();
        assert_eq!(recorded.nodes(), ips(&["10.0.0.10", "10.0.0.11"]).as_slice());
    }

    /// Story: deleting resets the live hosts, removes the rootfs and
    /// forgets the cluster.
    #[tokio::test]
    async fn story_delete_tears_down_and_forgets() {
        let h = harness(Some(running(&["10.0.0.1"], &["10.0.0.10"])), None);
        h.applier.store.save(&spec(&["10.0.0.1"], &["10.0.0.10"])).unwrap();

        let plan = h.applier.delete("prod").await.unwrap();

        assert_eq!(plan.actions(), &[Action::Reset, Action::UnmountRootfs]);
        assert_eq!(entries(&h.log), vec!["reset", "unmount"]);
        assert_eq!(h.applier.recorded("prod").unwrap(), None);
    }

    #[tokio::test]
    async fn deleting_unknown_cluster_is_an_error() {
        let h = harness(None, None);
        let err = h.applier.delete("ghost").await.unwrap_err();
        assert!(err.to_string().contains("no cluster named 'ghost'"));
    }
}
