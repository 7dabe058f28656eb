//! k0s flavor.
//!
//! k0s owns its own PKI and etcd membership, so this backend only renders
//! the cluster config, hands out join tokens and drives the `k0s` service.
//! Controllers only carry node objects when they also run workloads, so
//! draining a controller without one is skipped.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use keel_common::retry::retry_with_backoff;
use keel_common::settings::Settings;
use keel_common::{Error, Result, RuntimeFlavor, API_SERVER_DOMAIN, API_SERVER_PORT};
use keel_ssh::shell::quote;
use keel_ssh::{run_on_hosts, wait_ready, CancellationToken, RemoteExecutor};

use crate::context::{JoinCredentials, RuntimeContext};
use crate::lifecycle::ClusterRuntime;
use crate::metadata;
use crate::registry::{self, RegistryConfig};
use crate::remote::{self, push_rendered, remove_hosts_entry_command};
use crate::templates::{K0sValues, TemplateEngine, K0S_CONFIG};
use crate::upgrade::{rolling_upgrade, HostUpgrade, Role};
use crate::version::KubeVersion;

/// Admin kubeconfig k0s writes on every controller.
pub const ADMIN_CONF: &str = "/var/lib/k0s/pki/admin.conf";

const CONFIG_PATH: &str = "/etc/k0s/k0s.yaml";
const CONTROLLER_TOKEN: &str = "/etc/k0s/controller-token";
const WORKER_TOKEN: &str = "/etc/k0s/worker-token";
const CRI_SOCKET: &str = "remote:/run/containerd/containerd.sock";
/// kubectl invocation usable on any controller.
pub const KUBECTL: &str = "k0s kubectl";
const TOKEN_EXPIRY: &str = "876000h";

/// k0s join role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum K0sRole {
    Controller,
    Worker,
}

impl K0sRole {
    fn as_str(self) -> &'static str {
        match self {
            K0sRole::Controller => "controller",
            K0sRole::Worker => "worker",
        }
    }

    fn token_path(self) -> &'static str {
        match self {
            K0sRole::Controller => CONTROLLER_TOKEN,
            K0sRole::Worker => WORKER_TOKEN,
        }
    }
}

/// Lifecycle backed by `k0s`.
pub struct K0sRuntime {
    exec: Arc<dyn RemoteExecutor>,
    settings: Settings,
    cancel: CancellationToken,
    templates: TemplateEngine,
}

impl K0sRuntime {
    /// New runtime sharing the caller's executor and cancellation token.
    pub fn new(
        exec: Arc<dyn RemoteExecutor>,
        settings: Settings,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            exec,
            settings,
            cancel,
            templates: TemplateEngine::new()?,
        })
    }

    fn exec(&self) -> &dyn RemoteExecutor {
        self.exec.as_ref()
    }

    async fn resolve_version(
        &self,
        ctx: RuntimeContext,
        host: IpAddr,
    ) -> Result<(RuntimeContext, KubeVersion)> {
        if let Some(version) = ctx.version() {
            return Ok((ctx, version));
        }
        let version = metadata::resolve_version(self.exec(), host, &ctx).await?;
        Ok((ctx.with_version(version), version))
    }

    fn render_config(
        &self,
        ctx: &RuntimeContext,
        master0: IpAddr,
        registry: &RegistryConfig,
    ) -> Result<String> {
        let network = &ctx.cluster().spec.network;
        Ok(self.templates.render(
            K0S_CONFIG,
            &K0sValues {
                cluster_name: ctx.cluster().name().to_string(),
                master0,
                api_domain: API_SERVER_DOMAIN.to_string(),
                api_port: API_SERVER_PORT,
                cert_sans: ctx.cert_sans(),
                pod_cidr: network.pod_cidr.clone(),
                svc_cidr: network.svc_cidr.clone(),
                dns_domain: network.dns_domain.clone(),
                provider: K0sValues::provider_for(network.cni.as_deref()),
                registry: registry.address(),
            },
        )?)
    }

    async fn push_config(&self, host: IpAddr, ctx: &RuntimeContext, config: &str) -> Result<()> {
        self.exec().cmd(host, "mkdir -p /etc/k0s").await?;
        push_rendered(self.exec(), host, ctx, config, CONFIG_PATH).await?;
        Ok(())
    }

    async fn create_token(&self, master0: IpAddr, role: K0sRole) -> Result<String> {
        let out = self
            .exec()
            .cmd(
                master0,
                &format!(
                    "k0s token create --role={} --expiry={TOKEN_EXPIRY}",
                    role.as_str()
                ),
            )
            .await?;
        let token = out
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default();
        if token.is_empty() || token.contains(char::is_whitespace) {
            return Err(Error::parse(
                "k0s token create",
                format!("unexpected {} token output", role.as_str()),
            ));
        }
        Ok(token.to_string())
    }

    async fn ensure_credentials(
        &self,
        ctx: RuntimeContext,
        master0: IpAddr,
    ) -> Result<RuntimeContext> {
        if matches!(ctx.credentials(), Some(JoinCredentials::K0s { .. })) {
            return Ok(ctx);
        }
        info!(master = %master0, "creating k0s join tokens");
        let creds = JoinCredentials::K0s {
            controller_token: self.create_token(master0, K0sRole::Controller).await?,
            worker_token: self.create_token(master0, K0sRole::Worker).await?,
        };
        Ok(ctx.with_credentials(creds))
    }

    /// Wait until the API answers `/readyz` on a controller.
    async fn wait_api(&self, host: IpAddr) -> Result<()> {
        let exec = self.exec();
        retry_with_backoff(
            &self.settings.ssh.ready_retry(),
            &format!("k0s api {host}"),
            || async move {
                let out = exec
                    .cmd(host, &format!("{KUBECTL} get --raw=/readyz"))
                    .await?;
                if out.trim() == "ok" {
                    Ok(())
                } else {
                    Err(Error::connectivity(host, "k0s api not ready"))
                }
            },
        )
        .await
    }

    async fn join(
        &self,
        host: IpAddr,
        ctx: &RuntimeContext,
        role: K0sRole,
        config: Option<&str>,
    ) -> Result<()> {
        let Some(JoinCredentials::K0s {
            controller_token,
            worker_token,
        }) = ctx.credentials()
        else {
            return Err(Error::internal_with_context(
                "k0s join",
                "no k0s join tokens in context",
            ));
        };
        let token = match role {
            K0sRole::Controller => controller_token,
            K0sRole::Worker => worker_token,
        };

        if let Some(config) = config {
            self.push_config(host, ctx, config).await?;
        } else {
            self.exec().cmd(host, "mkdir -p /etc/k0s").await?;
        }
        push_rendered(self.exec(), host, ctx, token, role.token_path()).await?;

        let install = match role {
            K0sRole::Controller => format!(
                "k0s install controller --token-file {CONTROLLER_TOKEN} -c {CONFIG_PATH} --cri-socket {CRI_SOCKET}"
            ),
            K0sRole::Worker => format!(
                "k0s install worker --cri-socket {CRI_SOCKET} --token-file {WORKER_TOKEN}"
            ),
        };
        info!(host = %host, role = role.as_str(), "k0s join");
        self.exec()
            .cmd_async(host, &[install, "k0s start".to_string()])
            .await
    }

    async fn prepare_host(
        &self,
        host: IpAddr,
        api_target: IpAddr,
        ctx: &RuntimeContext,
        registry: &RegistryConfig,
        master0: IpAddr,
    ) -> Result<()> {
        let exec = self.exec();
        remote::ensure_hosts_entry(exec, host, api_target, API_SERVER_DOMAIN).await?;
        remote::ensure_hosts_entry(exec, host, registry.host(master0), &registry.domain).await?;
        remote::bootstrap_host(exec, host, ctx).await?;
        registry::trust(exec, host, ctx, registry).await
    }

    async fn reset_host(
        &self,
        host: IpAddr,
        ctx: &RuntimeContext,
        registry: &RegistryConfig,
    ) -> Result<()> {
        info!(host = %host, "resetting host");
        self.exec()
            .cmd_async(
                host,
                &[
                    "if command -v k0s >/dev/null 2>&1; then k0s stop || true; k0s reset; fi"
                        .to_string(),
                    "rm -rf /etc/k0s $HOME/.kube".to_string(),
                    remove_hosts_entry_command(API_SERVER_DOMAIN),
                    remove_hosts_entry_command(&registry.domain),
                ],
            )
            .await?;
        remote::run_clean_script(self.exec(), host, ctx).await
    }
}

#[async_trait]
impl ClusterRuntime for K0sRuntime {
    fn flavor(&self) -> RuntimeFlavor {
        RuntimeFlavor::K0s
    }

    async fn init(&self, ctx: RuntimeContext) -> Result<RuntimeContext> {
        let exec = self.exec();
        let master0 = ctx.require_master0()?;
        info!(master = %master0, "initialising k0s controller");

        wait_ready(exec, &[master0], &self.settings.ssh.ready_retry(), &self.cancel).await?;
        let (ctx, version) = self.resolve_version(ctx, master0).await?;
        let registry = registry::load(exec, master0, &ctx).await?;
        self.prepare_host(master0, master0, &ctx, &registry, master0)
            .await?;
        registry::ensure(exec, registry.host(master0), &ctx, &registry).await?;

        if exec.exists(master0, ADMIN_CONF).await? {
            info!(master = %master0, "k0s controller already running");
        } else {
            let config = self.render_config(&ctx, master0, &registry)?;
            self.push_config(master0, &ctx, &config).await?;
            exec.cmd_async(
                master0,
                &[
                    format!("k0s install controller -c {CONFIG_PATH} --cri-socket {CRI_SOCKET}"),
                    "k0s start".to_string(),
                ],
            )
            .await?;
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.wait_api(master0).await?;

        exec.fetch(master0, ADMIN_CONF, &ctx.local_dir().join("admin.conf"))
            .await?;
        let ctx = self.ensure_credentials(ctx, master0).await?;

        info!(master = %master0, version = %version, "k0s controller initialised");
        Ok(ctx.with_masters_joined(&[master0]))
    }

    async fn join_masters(&self, ctx: RuntimeContext, ips: &[IpAddr]) -> Result<RuntimeContext> {
        if ips.is_empty() {
            return Ok(ctx);
        }
        let exec = self.exec();
        let master0 = ctx.require_master0()?;
        wait_ready(exec, ips, &self.settings.ssh.ready_retry(), &self.cancel).await?;

        let mut ctx = self.ensure_credentials(ctx, master0).await?;
        let registry = registry::load(exec, master0, &ctx).await?;
        let config = self.render_config(&ctx, master0, &registry)?;

        for &host in ips {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            info!(host = %host, "joining controller");
            self.prepare_host(host, master0, &ctx, &registry, master0)
                .await?;
            self.join(host, &ctx, K0sRole::Controller, Some(&config))
                .await?;
            remote::ensure_hosts_entry(exec, host, host, API_SERVER_DOMAIN).await?;
            self.wait_api(host).await?;
            ctx = ctx.with_masters_joined(&[host]);
        }
        Ok(ctx)
    }

    async fn join_nodes(&self, ctx: RuntimeContext, ips: &[IpAddr]) -> Result<RuntimeContext> {
        if ips.is_empty() {
            return Ok(ctx);
        }
        let exec = self.exec();
        let master0 = ctx.require_master0()?;
        wait_ready(exec, ips, &self.settings.ssh.ready_retry(), &self.cancel).await?;

        let ctx = self.ensure_credentials(ctx, master0).await?;
        let registry = registry::load(exec, master0, &ctx).await?;

        info!(count = ips.len(), "joining workers");
        run_on_hosts(ips, None, &self.cancel, |host| {
            let (ctx, registry) = (&ctx, &registry);
            async move {
                self.prepare_host(host, master0, ctx, registry, master0)
                    .await?;
                self.join(host, ctx, K0sRole::Worker, None).await
            }
        })
        .await?;

        Ok(ctx.with_nodes_joined(ips))
    }

    async fn delete_masters(
        &self,
        ctx: RuntimeContext,
        ips: &[IpAddr],
    ) -> Result<RuntimeContext> {
        if ips.is_empty() {
            return Ok(ctx);
        }
        let exec = self.exec();
        let master0 = ctx.require_master0()?;
        let registry = registry::load(exec, master0, &ctx).await?;

        let mut ctx = ctx;
        for &host in ips {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            info!(host = %host, "removing controller");
            exec.cmd(host, "k0s etcd leave").await?;
            self.reset_host(host, &ctx, &registry).await?;
            ctx = ctx.with_masters_removed(&[host]);
        }
        Ok(ctx)
    }

    async fn delete_nodes(&self, ctx: RuntimeContext, ips: &[IpAddr]) -> Result<RuntimeContext> {
        if ips.is_empty() {
            return Ok(ctx);
        }
        let exec = self.exec();
        let master0 = ctx.require_master0()?;
        let registry = registry::load(exec, master0, &ctx).await?;

        info!(count = ips.len(), "removing workers");
        let names = run_on_hosts(ips, None, &self.cancel, |host| {
            let (ctx, registry) = (&ctx, &registry);
            async move {
                let name = exec.hostname(host).await?;
                self.reset_host(host, ctx, registry).await?;
                Ok(name)
            }
        })
        .await?;

        for name in &names {
            remote::remove_node_object(exec, ctx.masters(), KUBECTL, name).await?;
        }
        Ok(ctx.with_nodes_removed(ips))
    }

    async fn upgrade(&self, ctx: RuntimeContext) -> Result<RuntimeContext> {
        let master0 = ctx.require_master0()?;
        let (ctx, version) = self.resolve_version(ctx, master0).await?;
        info!(version = %version, "rolling k0s upgrade");

        let mut masters = vec![master0];
        masters.extend(ctx.masters().iter().filter(|m| **m != master0));

        let steps = K0sUpgrade {
            exec: self.exec(),
            ctx: &ctx,
            master0,
        };
        rolling_upgrade(
            &steps,
            &masters,
            ctx.nodes(),
            &self.settings.upgrade.ready_poll(),
            &self.cancel,
        )
        .await?;
        Ok(ctx)
    }

    async fn reset(&self, ctx: RuntimeContext) -> Result<RuntimeContext> {
        let exec = self.exec();
        let master0 = ctx.require_master0()?;
        let registry = registry::load(exec, master0, &ctx).await?;

        run_on_hosts(ctx.nodes(), None, &self.cancel, |host| {
            let (ctx, registry) = (&ctx, &registry);
            async move { self.reset_host(host, ctx, registry).await }
        })
        .await?;

        let mut masters = ctx.masters().to_vec();
        if !masters.contains(&master0) {
            masters.insert(0, master0);
        }
        run_on_hosts(&masters, None, &self.cancel, |host| {
            let (ctx, registry) = (&ctx, &registry);
            async move { self.reset_host(host, ctx, registry).await }
        })
        .await?;

        registry::recycle(exec, registry.host(master0)).await?;
        Ok(ctx.emptied())
    }
}

struct K0sUpgrade<'a> {
    exec: &'a dyn RemoteExecutor,
    ctx: &'a RuntimeContext,
    master0: IpAddr,
}

impl K0sUpgrade<'_> {
    fn is_controller(&self, host: IpAddr) -> bool {
        host == self.master0 || self.ctx.masters().contains(&host)
    }

    async fn kubectl_on_node(&self, host: IpAddr, verb: &str) -> Result<()> {
        let name = self.exec.hostname(host).await?;
        let found = self
            .exec
            .cmd(
                self.master0,
                &format!("{KUBECTL} get node {} -o name --ignore-not-found", quote(&name)),
            )
            .await?;
        if found.trim().is_empty() {
            debug!(host = %host, node = %name, "no node object, skipping {verb}");
            return Ok(());
        }
        self.exec
            .cmd(self.master0, &format!("{KUBECTL} {verb} {}", quote(&name)))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl HostUpgrade for K0sUpgrade<'_> {
    async fn drain(&self, host: IpAddr) -> Result<()> {
        self.kubectl_on_node(host, "drain --ignore-daemonsets --delete-emptydir-data --force")
            .await
    }

    async fn upgrade(&self, host: IpAddr, _role: Role) -> Result<()> {
        self.exec
            .cmd_async(
                host,
                &[
                    "k0s stop".to_string(),
                    format!(
                        "cp -f {} /usr/local/bin/k0s",
                        quote(&self.ctx.rootfs_path("bin/k0s"))
                    ),
                ],
            )
            .await
    }

    async fn restart(&self, host: IpAddr) -> Result<()> {
        self.exec.cmd(host, "k0s start").await?;
        Ok(())
    }

    async fn ready(&self, host: IpAddr) -> Result<bool> {
        if self.is_controller(host) {
            let out = self
                .exec
                .cmd(host, &format!("{KUBECTL} get --raw=/readyz"))
                .await?;
            return Ok(out.trim() == "ok");
        }
        let name = self.exec.hostname(host).await?;
        let out = self
            .exec
            .cmd(self.master0, &remote::node_ready_command(KUBECTL, &name))
            .await?;
        Ok(remote::node_ready(&out))
    }

    async fn uncordon(&self, host: IpAddr) -> Result<()> {
        self.kubectl_on_node(host, "uncordon").await
    }
}

#[cfg(test)]
mod tests {
    use keel_common::ClusterSpec;
    use keel_ssh::testing::ScriptedExecutor;

    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    struct Harness {
        _dir: tempfile::TempDir,
        exec: Arc<ScriptedExecutor>,
        runtime: K0sRuntime,
        settings: Settings,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        settings.ssh.ready_attempts = 1;
        settings.ssh.ready_backoff_secs = 0;
        settings.upgrade.poll_interval_secs = 0;
        settings.upgrade.max_polls = 2;
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on("get --raw=/readyz", "ok");
        exec.on("--role=controller", "CONTROLLERTOKEN\n");
        exec.on("--role=worker", "WORKERTOKEN\n");
        let runtime =
            K0sRuntime::new(exec.clone(), settings.clone(), CancellationToken::new()).unwrap();
        Harness {
            _dir: dir,
            exec,
            runtime,
            settings,
        }
    }

    fn ctx(h: &Harness, masters: &[&str], nodes: &[&str]) -> RuntimeContext {
        let masters: Vec<IpAddr> = masters.iter().map(|m| ip(m)).collect();
        let nodes: Vec<IpAddr> = nodes.iter().map(|n| ip(n)).collect();
        let mut spec = ClusterSpec::new("edge", "k0s:v1.26.3", masters, nodes);
        spec.spec.runtime = RuntimeFlavor::K0s;
        RuntimeContext::new(Arc::new(spec), &h.settings, vec![], vec![])
    }

    fn tokens() -> JoinCredentials {
        JoinCredentials::K0s {
            controller_token: "CONTROLLERTOKEN".into(),
            worker_token: "WORKERTOKEN".into(),
        }
    }

    /// Story: the first controller is installed from a rendered config and
    /// hands back both join tokens.
    #[tokio::test]
    async fn story_init_installs_controller_and_creates_tokens() {
        let h = harness();
        let m0 = ip("10.0.0.1");

        let ctx = h.runtime.init(ctx(&h, &["10.0.0.1"], &[])).await.unwrap();

        assert_eq!(ctx.masters(), &[m0]);
        assert_eq!(ctx.credentials(), Some(&tokens()));
        let cmds = h.exec.commands_on(m0);
        let install = cmds
            .iter()
            .position(|c| c.starts_with("k0s install controller -c /etc/k0s/k0s.yaml"))
            .unwrap();
        assert_eq!(cmds[install + 1], "k0s start");
        assert!(h.exec.copies_to(m0).contains(&CONFIG_PATH.to_string()));
        assert!(ctx.local_dir().join("admin.conf").exists());

        let config =
            std::fs::read_to_string(ctx.local_dir().join("rendered/10.0.0.1/k0s.yaml")).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&config).unwrap();
        assert_eq!(doc["spec"]["api"]["address"], "10.0.0.1");
        assert_eq!(doc["spec"]["images"]["repository"], "keel.hub:5000");
        assert_eq!(doc["spec"]["network"]["provider"], "kuberouter");
    }

    #[tokio::test]
    async fn running_controller_is_not_reinstalled() {
        let h = harness();
        h.exec.on("pki/admin.conf ]", "yes");
        h.runtime.init(ctx(&h, &["10.0.0.1"], &[])).await.unwrap();
        assert!(h.exec.hosts_running("k0s install").is_empty());
    }

    #[tokio::test]
    async fn garbage_token_output_is_rejected() {
        let h = harness();
        h.exec.on("--role=worker", "Error: failed to connect\n");
        let err = h.runtime.init(ctx(&h, &["10.0.0.1"], &[])).await.unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[tokio::test]
    async fn controllers_join_with_controller_token() {
        let h = harness();
        let (m0, m1) = (ip("10.0.0.1"), ip("10.0.0.2"));
        let ctx = ctx(&h, &["10.0.0.1", "10.0.0.2"], &[])
            .with_masters_joined(&[m0])
            .with_credentials(tokens());

        let ctx = h.runtime.join_masters(ctx, &[m1]).await.unwrap();

        assert_eq!(ctx.masters(), &[m0, m1]);
        let copies = h.exec.copies_to(m1);
        assert!(copies.contains(&CONTROLLER_TOKEN.to_string()));
        assert!(copies.contains(&CONFIG_PATH.to_string()));
        let token = std::fs::read_to_string(
            ctx.local_dir().join("rendered/10.0.0.2/controller-token"),
        )
        .unwrap();
        assert_eq!(token, "CONTROLLERTOKEN");
        assert!(h
            .exec
            .commands_on(m1)
            .iter()
            .any(|c| c.starts_with("k0s install controller --token-file /etc/k0s/controller-token")));
        // tokens were already in the context
        assert!(!h.exec.commands_on(m0).iter().any(|c| c.contains("token create")));
    }

    #[tokio::test]
    async fn workers_join_concurrently_with_worker_token() {
        let h = harness();
        let m0 = ip("10.0.0.1");
        let workers = [ip("10.0.0.10"), ip("10.0.0.11")];
        let ctx = ctx(&h, &["10.0.0.1"], &["10.0.0.10", "10.0.0.11"])
            .with_masters_joined(&[m0]);

        let ctx = h.runtime.join_nodes(ctx, &workers).await.unwrap();

        assert_eq!(ctx.nodes(), &workers);
        for w in workers {
            assert_eq!(h.exec.copies_to(w), vec![WORKER_TOKEN.to_string()]);
            let cmds = h.exec.commands_on(w);
            assert_eq!(cmds[cmds.len() - 1], "k0s start");
            assert!(cmds[cmds.len() - 2].starts_with("k0s install worker"));
        }
        assert_eq!(h.exec.hosts_running("token create"), vec![m0]);
    }

    /// Story: a controller leaves etcd before it is wiped.
    #[tokio::test]
    async fn story_controller_leaves_etcd_before_reset() {
        let h = harness();
        let (m0, m1) = (ip("10.0.0.1"), ip("10.0.0.2"));
        let ctx = ctx(&h, &["10.0.0.1"], &[]).with_masters_joined(&[m0, m1]);

        let ctx = h.runtime.delete_masters(ctx, &[m1]).await.unwrap();

        assert_eq!(ctx.masters(), &[m0]);
        let cmds = h.exec.commands_on(m1);
        assert_eq!(cmds[0], "k0s etcd leave");
        assert!(cmds[1].contains("k0s reset"));
        assert!(h.exec.commands_on(m0).iter().all(|c| !c.contains("k0s reset")));
    }

    #[tokio::test]
    async fn failed_etcd_leave_keeps_the_controller() {
        let h = harness();
        let (m0, m1) = (ip("10.0.0.1"), ip("10.0.0.2"));
        h.exec.fail_on(m1, "etcd leave", 1, "quorum lost");
        let ctx = ctx(&h, &["10.0.0.1"], &[]).with_masters_joined(&[m0, m1]);

        let err = h.runtime.delete_masters(ctx, &[m1]).await.unwrap_err();
        assert_eq!(err.host(), Some("10.0.0.2"));
        assert!(h.exec.hosts_running("k0s reset").is_empty());
    }

    #[tokio::test]
    async fn delete_workers_removes_node_objects() {
        let h = harness();
        let (m0, w1) = (ip("10.0.0.1"), ip("10.0.0.10"));
        h.exec.on_host(w1, "hostname", "edge-worker-1");
        let ctx = ctx(&h, &["10.0.0.1"], &[])
            .with_masters_joined(&[m0])
            .with_nodes_joined(&[w1]);

        let ctx = h.runtime.delete_nodes(ctx, &[w1]).await.unwrap();

        assert!(ctx.nodes().is_empty());
        assert!(h
            .exec
            .commands_on(m0)
            .contains(&"k0s kubectl delete node edge-worker-1 --ignore-not-found".to_string()));
    }

    #[tokio::test]
    async fn upgrade_restarts_every_host_and_drains_only_controllers() {
        let h = harness();
        let (m0, m1, w1) = (ip("10.0.0.1"), ip("10.0.0.2"), ip("10.0.0.10"));
        h.exec.on_host(m0, "hostname", "edge-ctl-0");
        h.exec.on_host(m1, "hostname", "edge-ctl-1");
        h.exec.on_host(w1, "hostname", "edge-worker-1");
        h.exec.on("get node edge-ctl-0 -o name", "node/edge-ctl-0");
        h.exec.on("jsonpath", "True");
        let ctx = ctx(&h, &["10.0.0.1", "10.0.0.2"], &[])
            .with_masters_joined(&[m0, m1])
            .with_nodes_joined(&[w1]);

        h.runtime.upgrade(ctx).await.unwrap();

        assert_eq!(h.exec.hosts_running("k0s stop"), vec![m0, m1, w1]);
        assert_eq!(
            h.exec.hosts_running("cp -f /var/lib/keel/edge/rootfs/bin/k0s"),
            vec![m0, m1, w1]
        );
        let cordoning: Vec<String> = h
            .exec
            .commands_on(m0)
            .into_iter()
            .filter(|c| c.contains(" drain ") || c.contains(" uncordon "))
            .collect();
        assert_eq!(
            cordoning,
            vec![
                "k0s kubectl drain --ignore-daemonsets --delete-emptydir-data --force edge-ctl-0",
                "k0s kubectl uncordon edge-ctl-0",
            ]
        );
        assert!(!h
            .exec
            .commands_on(m0)
            .iter()
            .any(|c| c.contains("edge-worker-1") && !c.contains("jsonpath")));
    }

    #[tokio::test]
    async fn reset_wipes_workers_and_controllers() {
        let h = harness();
        let (m0, w1) = (ip("10.0.0.1"), ip("10.0.0.10"));
        let ctx = ctx(&h, &["10.0.0.1"], &[])
            .with_masters_joined(&[m0])
            .with_nodes_joined(&[w1])
            .with_credentials(tokens());

        let ctx = h.runtime.reset(ctx).await.unwrap();

        assert!(ctx.masters().is_empty() && ctx.credentials().is_none());
        assert_eq!(h.exec.hosts_running("k0s reset"), vec![w1, m0]);
    }
}
