//! Rootfs distribution over the remote executor.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use keel_common::settings::Settings;
use keel_common::{ClusterSpec, Result};
use keel_ssh::shell::quote;
use keel_ssh::{run_on_hosts, CancellationToken, RemoteExecutor};

use crate::collaborators::RootfsMounter;
use crate::image::LocalImageStore;

/// Marker written next to a mounted rootfs, holding the image reference.
pub const MARKER_FILE: &str = ".keel-image";

/// [`RootfsMounter`] that copies the local image directory to each host.
pub struct RemoteRootfsMounter {
    exec: Arc<dyn RemoteExecutor>,
    images: LocalImageStore,
    settings: Settings,
    cancel: CancellationToken,
}

impl RemoteRootfsMounter {
    /// Mounter copying from the settings' image store.
    pub fn new(exec: Arc<dyn RemoteExecutor>, settings: Settings, cancel: CancellationToken) -> Self {
        Self {
            exec,
            images: LocalImageStore::new(&settings),
            settings,
            cancel,
        }
    }

    async fn mount_one(&self, host: IpAddr, cluster: &ClusterSpec) -> Result<()> {
        let image = &cluster.spec.image;
        let rootfs = self.settings.rootfs_dir(cluster.name());
        let rootfs = rootfs.to_string_lossy();
        let marker = quote(&format!("{rootfs}/{MARKER_FILE}"));

        let mounted = self
            .exec
            .cmd(host, &format!("cat {marker} 2>/dev/null || true"))
            .await?;
        if mounted.trim() == image {
            debug!(host = %host, image = %image, "rootfs already mounted");
            return Ok(());
        }

        info!(host = %host, image = %image, "mounting rootfs");
        self.exec
            .copy(host, &self.images.image_dir(image), &rootfs)
            .await?;
        self.exec
            .cmd(host, &format!("echo {} > {marker}", quote(image)))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RootfsMounter for RemoteRootfsMounter {
    async fn mount(&self, cluster: &ClusterSpec, hosts: &[IpAddr]) -> Result<()> {
        let limit = Some(self.settings.ssh.transfer_concurrency);
        run_on_hosts(hosts, limit, &self.cancel, |host| self.mount_one(host, cluster)).await?;
        Ok(())
    }

    async fn unmount(&self, cluster: &ClusterSpec) -> Result<()> {
        let rootfs = self.settings.rootfs_dir(cluster.name());
        let command = format!("rm -rf {}", quote(&rootfs.to_string_lossy()));
        let hosts = cluster.all_hosts();
        info!(cluster = %cluster.name(), hosts = hosts.len(), "unmounting rootfs");
        run_on_hosts(&hosts, None, &self.cancel, |host| {
            let command = command.clone();
            async move { self.exec.cmd(host, &command).await.map(drop) }
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keel_ssh::testing::ScriptedExecutor;

    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn setup(exec: Arc<ScriptedExecutor>) -> (tempfile::TempDir, RemoteRootfsMounter) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mounter = RemoteRootfsMounter::new(exec, settings, CancellationToken::new());
        (dir, mounter)
    }

    fn cluster() -> ClusterSpec {
        ClusterSpec::new(
            "prod",
            "kubernetes:v1.22.15",
            vec![ip("10.0.0.1")],
            vec![ip("10.0.0.10")],
        )
    }

    #[tokio::test]
    async fn mount_copies_and_marks_each_host() {
        let exec = Arc::new(ScriptedExecutor::new());
        let (dir, mounter) = setup(exec.clone());
        let cluster = cluster();

        mounter
            .mount(&cluster, &[ip("10.0.0.1"), ip("10.0.0.10")])
            .await
            .unwrap();

        let rootfs = dir.path().join("prod/rootfs").to_string_lossy().to_string();
        for host in ["10.0.0.1", "10.0.0.10"] {
            assert_eq!(exec.copies_to(ip(host)), vec![rootfs.clone()]);
            assert!(exec
                .commands_on(ip(host))
                .iter()
                .any(|c| c.starts_with("echo kubernetes:v1.22.15 >") && c.contains(MARKER_FILE)));
        }
    }

    /// Story: re-applying the same image does not copy the rootfs again.
    #[tokio::test]
    async fn story_second_mount_is_a_no_op() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on(MARKER_FILE, "kubernetes:v1.22.15\n");
        let (_dir, mounter) = setup(exec.clone());

        mounter.mount(&cluster(), &[ip("10.0.0.1")]).await.unwrap();

        assert!(exec.copies_to(ip("10.0.0.1")).is_empty());
    }

    #[tokio::test]
    async fn different_image_is_copied_over() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on(MARKER_FILE, "kubernetes:v1.21.14\n");
        let (_dir, mounter) = setup(exec.clone());

        mounter.mount(&cluster(), &[ip("10.0.0.1")]).await.unwrap();

        assert_eq!(exec.copies_to(ip("10.0.0.1")).len(), 1);
    }

    #[tokio::test]
    async fn unmount_clears_every_host() {
        let exec = Arc::new(ScriptedExecutor::new());
        let (_dir, mounter) = setup(exec.clone());

        mounter.unmount(&cluster()).await.unwrap();

        let mut hosts = exec.hosts_running("rm -rf");
        hosts.sort();
        assert_eq!(hosts, vec![ip("10.0.0.1"), ip("10.0.0.10")]);
    }
}
