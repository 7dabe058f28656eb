//! Script hooks shipped inside the image rootfs.
//!
//! Guest hooks run once on master0 after membership changes. Plugins run
//! on every host at fixed lifecycle phases. Both are optional: an image
//! without the script simply has nothing to run.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use keel_common::settings::Settings;
use keel_common::{ClusterSpec, Error, Result};
use keel_ssh::shell::quote;
use keel_ssh::{run_on_hosts, CancellationToken, RemoteExecutor};

use crate::collaborators::{GuestCommandRunner, Phase, PluginHookRunner};

/// Guest hook script, relative to the rootfs.
pub const GUEST_SCRIPT: &str = "scripts/guest.sh";

/// Plugin directory, relative to the rootfs.
pub const PLUGIN_DIR: &str = "plugins";

/// Run `script` from inside `rootfs` if it exists; `Ok(false)` when absent.
async fn run_script(
    exec: &dyn RemoteExecutor,
    host: IpAddr,
    cluster: &ClusterSpec,
    rootfs: &str,
    script: &str,
) -> Result<bool> {
    let path = format!("{rootfs}/{script}");
    if !exec.exists(host, &path).await? {
        return Ok(false);
    }
    let command = format!(
        "cd {} && KEEL_CLUSTER={} bash {}",
        quote(rootfs),
        quote(cluster.name()),
        quote(script)
    );
    exec.cmd(host, &command).await?;
    Ok(true)
}

/// [`GuestCommandRunner`] running the image's guest script on master0.
pub struct ScriptGuestRunner {
    exec: Arc<dyn RemoteExecutor>,
    settings: Settings,
}

impl ScriptGuestRunner {
    /// Runner over `exec`.
    pub fn new(exec: Arc<dyn RemoteExecutor>, settings: Settings) -> Self {
        Self { exec, settings }
    }
}

#[async_trait]
impl GuestCommandRunner for ScriptGuestRunner {
    async fn apply(&self, cluster: &ClusterSpec) -> Result<()> {
        let master0 = cluster.master0().ok_or_else(|| {
            Error::validation_for(cluster.name(), "guest hooks need a master0")
        })?;
        let rootfs = self.settings.rootfs_dir(cluster.name());
        let ran = run_script(
            self.exec.as_ref(),
            master0,
            cluster,
            &rootfs.to_string_lossy(),
            GUEST_SCRIPT,
        )
        .await?;
        if ran {
            info!(cluster = %cluster.name(), "guest hooks applied");
        } else {
            debug!(cluster = %cluster.name(), "image has no guest hooks");
        }
        Ok(())
    }
}

/// [`PluginHookRunner`] running `plugins/<phase>.sh` on every host.
pub struct ScriptPluginRunner {
    exec: Arc<dyn RemoteExecutor>,
    settings: Settings,
    cancel: CancellationToken,
}

impl ScriptPluginRunner {
    /// Runner over `exec`.
    pub fn new(exec: Arc<dyn RemoteExecutor>, settings: Settings, cancel: CancellationToken) -> Self {
        Self {
            exec,
            settings,
            cancel,
        }
    }
}

#[async_trait]
impl PluginHookRunner for ScriptPluginRunner {
    async fn run(&self, cluster: &ClusterSpec, phase: Phase) -> Result<()> {
        let rootfs = self.settings.rootfs_dir(cluster.name());
        let rootfs = rootfs.to_string_lossy();
        let script = format!("{PLUGIN_DIR}/{phase}.sh");
        debug!(cluster = %cluster.name(), phase = %phase, "running plugins");

        run_on_hosts(&cluster.all_hosts(), None, &self.cancel, |host| {
            let rootfs = &rootfs;
            let script = &script;
            async move { run_script(self.exec.as_ref(), host, cluster, rootfs, script).await }
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

    fn cluster() -> ClusterSpec {
        ClusterSpec::new(
            "prod",
            "kubernetes:v1.22.15",
            vec![ip("10.0.0.1"), ip("10.0.0.2")],
            vec![ip("10.0.0.10")],
        )
    }

    fn settings() -> Settings {
        Settings {
            data_dir: "/var/lib/keel".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn guest_script_runs_on_master0_only() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on("if [ -e", "yes");
        let runner = ScriptGuestRunner::new(exec.clone(), settings());

        runner.apply(&cluster()).await.unwrap();

        assert_eq!(exec.hosts_running("bash scripts/guest.sh"), vec![ip("10.0.0.1")]);
        let expected = "cd /var/lib/keel/prod/rootfs && KEEL_CLUSTER=prod bash scripts/guest.sh";
        assert!(exec.commands_on(ip("10.0.0.1")).iter().any(|c| c == expected));
    }

    #[tokio::test]
    async fn missing_guest_script_is_skipped() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on("if [ -e", "no");
        let runner = ScriptGuestRunner::new(exec.clone(), settings());

        runner.apply(&cluster()).await.unwrap();

        assert!(exec.hosts_running("bash").is_empty());
    }

    /// Story: a pre-clean plugin runs on every host and a failure on one
    /// host surfaces with that host's address.
    #[tokio::test]
    async fn story_plugins_run_everywhere_and_report_failures() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on("if [ -e", "yes");
        exec.fail_on(ip("10.0.0.10"), "bash plugins/pre-clean.sh", 1, "boom");
        let runner = ScriptPluginRunner::new(exec.clone(), settings(), CancellationToken::new());

        let err = runner.run(&cluster(), Phase::PreClean).await.unwrap_err();
        assert_eq!(err.host(), Some("10.0.0.10"));

        let mut hosts = exec.hosts_running("bash plugins/pre-clean.sh");
        hosts.sort();
        assert_eq!(hosts, vec![ip("10.0.0.1"), ip("10.0.0.2"), ip("10.0.0.10")]);
    }
}
