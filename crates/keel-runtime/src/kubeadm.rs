//! kubeadm flavor.
//!
//! PKI and kubeconfigs are generated locally and pushed, so the operator
//! machine always holds the cluster CA. Control-plane joins run one host at
//! a time; worker joins and deletes fan out across hosts.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use keel_common::settings::Settings;
use keel_common::{Error, Result, RuntimeFlavor, API_SERVER_DOMAIN, API_SERVER_PORT};
use keel_ssh::{run_on_hosts, wait_ready, CancellationToken, RemoteExecutor};

use crate::context::{JoinCredentials, RuntimeContext};
use crate::join_output::{parse_certificate_key, parse_join_command, parse_token};
use crate::lifecycle::ClusterRuntime;
use crate::loadbalancer::{self, LVSCARE_MANIFEST};
use crate::metadata;
use crate::pki::{self, ClusterPki, PkiParams, Usage};
use crate::registry::{self, RegistryConfig};
use crate::remote::{self, push_rendered, remove_hosts_entry_command};
use crate::templates::{
    host_port, InitValues, JoinValues, KubeconfigValues, TemplateEngine, KUBEADM_INIT,
    KUBEADM_JOIN, KUBECONFIG,
};
use crate::upgrade::{rolling_upgrade, HostUpgrade, Role};
use crate::version::KubeVersion;

/// Admin kubeconfig on masters.
pub const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";

/// kubectl invocation usable on any master.
pub const KUBECTL: &str = "kubectl --kubeconfig /etc/kubernetes/admin.conf";
const APISERVER_MANIFEST: &str = "/etc/kubernetes/manifests/kube-apiserver.yaml";
const REMOTE_PKI: &str = "/etc/kubernetes/pki";
const INIT_CONFIG: &str = "kubeadm-config.yaml";
const JOIN_CONFIG: &str = "kubeadm-join-config.yaml";

/// Client kubeconfigs generated for master0: (file, common name, organization).
const KUBECONFIGS: [(&str, &str, Option<&str>); 3] = [
    ("admin.conf", "kubernetes-admin", Some("system:masters")),
    ("controller-manager.conf", "system:kube-controller-manager", None),
    ("scheduler.conf", "system:kube-scheduler", None),
];

/// Lifecycle backed by `kubeadm`.
pub struct KubeadmRuntime {
    exec: Arc<dyn RemoteExecutor>,
    settings: Settings,
    cancel: CancellationToken,
    templates: TemplateEngine,
}

impl KubeadmRuntime {
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

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
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

    fn pki_dir(ctx: &RuntimeContext) -> PathBuf {
        ctx.local_dir().join("pki")
    }

    /// Load or create the local PKI for the context's SANs and persist it.
    fn local_pki(&self, ctx: &RuntimeContext) -> Result<ClusterPki> {
        let dir = Self::pki_dir(ctx);
        let network = &ctx.cluster().spec.network;
        let pki = ClusterPki::load_or_generate(
            &dir,
            &PkiParams {
                sans: ctx.cert_sans(),
                service_cidr: network.svc_cidr.clone(),
                dns_domain: network.dns_domain.clone(),
            },
        )?;
        pki.write_to(&dir)?;
        Ok(pki)
    }

    fn local_discovery_hash(ctx: &RuntimeContext) -> Option<String> {
        let pem = std::fs::read_to_string(Self::pki_dir(ctx).join(pki::CA_CERT)).ok()?;
        pki::discovery_hash(&pem).ok()
    }

    async fn render_init_config(
        &self,
        ctx: &RuntimeContext,
        master0: IpAddr,
        version: KubeVersion,
        registry: &RegistryConfig,
    ) -> Result<String> {
        let network = &ctx.cluster().spec.network;
        let values = InitValues {
            api_version: version.kubeadm_api().to_string(),
            master0,
            api_port: API_SERVER_PORT,
            api_domain: API_SERVER_DOMAIN.to_string(),
            version: version.to_string(),
            registry: registry.address(),
            cri_socket: version.cri_socket().to_string(),
            pod_cidr: network.pod_cidr.clone(),
            svc_cidr: network.svc_cidr.clone(),
            dns_domain: network.dns_domain.clone(),
            cert_sans: ctx.cert_sans(),
            vip: ctx.vip(),
        };
        match &ctx.cluster().spec.kubeadm_config_template {
            Some(path) => {
                info!(template = %path.display(), "rendering operator init template");
                let source = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| Error::io(format!("read {}", path.display()), e))?;
                Ok(self.templates.render_str(&source, &values)?)
            }
            None => Ok(self.templates.render(KUBEADM_INIT, &values)?),
        }
    }

    async fn push_kubeconfigs(
        &self,
        host: IpAddr,
        ctx: &RuntimeContext,
        pki: &ClusterPki,
    ) -> Result<()> {
        for (file, common_name, organization) in KUBECONFIGS {
            let pair = pki.ca().issue(common_name, organization, &[], Usage::Client)?;
            let rendered = self.templates.render(
                KUBECONFIG,
                &KubeconfigValues {
                    cluster_name: ctx.cluster().name().to_string(),
                    server: format!("https://{API_SERVER_DOMAIN}:{API_SERVER_PORT}"),
                    user: common_name.to_string(),
                    ca_cert: pki.ca().ca_cert_pem().to_string(),
                    client_cert: pair.cert_pem,
                    client_key: pair.key_pem,
                },
            )?;
            push_rendered(self.exec(), host, ctx, &rendered, &format!("/etc/kubernetes/{file}"))
                .await?;
        }
        Ok(())
    }

    /// Fresh token, discovery hash and certificate key from master0.
    async fn regenerate_credentials(
        &self,
        master0: IpAddr,
        ctx: &RuntimeContext,
        version: KubeVersion,
    ) -> Result<JoinCredentials> {
        info!(master = %master0, "regenerating join credentials");
        let token = parse_token(&self.exec().cmd(master0, "kubeadm token create").await?)?;

        let discovery_hash = match Self::local_discovery_hash(ctx) {
            Some(hash) => hash,
            None => {
                let out = self
                    .exec()
                    .cmd(master0, "kubeadm token create --print-join-command")
                    .await?;
                parse_join_command(&out)?.discovery_hash
            }
        };

        let out = self
            .exec()
            .cmd(
                master0,
                &format!("kubeadm init phase upload-certs {}", version.upload_certs_flag()),
            )
            .await?;
        let certificate_key = Some(parse_certificate_key(&out)?);

        Ok(JoinCredentials::Kubeadm {
            token,
            discovery_hash,
            certificate_key,
        })
    }

    async fn ensure_credentials(
        &self,
        ctx: RuntimeContext,
        master0: IpAddr,
        version: KubeVersion,
        control_plane: bool,
    ) -> Result<RuntimeContext> {
        let usable = matches!(
            ctx.credentials(),
            Some(creds @ JoinCredentials::Kubeadm { .. })
                if !control_plane || creds.can_join_control_plane()
        );
        if usable {
            return Ok(ctx);
        }
        let creds = self.regenerate_credentials(master0, &ctx, version).await?;
        Ok(ctx.with_credentials(creds))
    }

    async fn run_join(
        &self,
        host: IpAddr,
        ctx: &RuntimeContext,
        version: KubeVersion,
        endpoint: String,
        advertise: Option<IpAddr>,
    ) -> Result<()> {
        let Some(JoinCredentials::Kubeadm {
            token,
            discovery_hash,
            certificate_key,
        }) = ctx.credentials()
        else {
            return Err(Error::internal_with_context(
                "kubeadm join",
                "no kubeadm join credentials in context",
            ));
        };
        let control_plane = advertise.is_some();

        let command = if version.legacy_join() {
            let mut cmd = format!(
                "kubeadm join {endpoint} --token {token} --discovery-token-ca-cert-hash {discovery_hash}"
            );
            if let Some(address) = advertise {
                cmd.push_str(&format!(
                    " --experimental-control-plane --apiserver-advertise-address {address}"
                ));
                if let Some(key) = certificate_key {
                    cmd.push_str(&format!(" --certificate-key {key}"));
                }
            }
            cmd
        } else {
            let rendered = self.templates.render(
                KUBEADM_JOIN,
                &JoinValues {
                    api_version: version.kubeadm_api().to_string(),
                    endpoint,
                    token: token.clone(),
                    discovery_hash: discovery_hash.clone(),
                    cri_socket: version.cri_socket().to_string(),
                    control_plane,
                    advertise_address: advertise,
                    api_port: API_SERVER_PORT,
                    certificate_key: certificate_key.clone(),
                },
            )?;
            let dst = ctx.rootfs_path(JOIN_CONFIG);
            push_rendered(self.exec(), host, ctx, &rendered, &dst).await?;
            format!("kubeadm join --config={dst} -v 0")
        };

        info!(host = %host, control_plane, "kubeadm join");
        self.exec().cmd_async(host, &[command]).await
    }

    async fn join_master(
        &self,
        host: IpAddr,
        master0: IpAddr,
        ctx: &RuntimeContext,
        version: KubeVersion,
        registry: &RegistryConfig,
    ) -> Result<()> {
        let exec = self.exec();
        remote::ensure_hosts_entry(exec, host, master0, API_SERVER_DOMAIN).await?;
        remote::ensure_hosts_entry(exec, host, registry.host(master0), &registry.domain).await?;
        remote::bootstrap_host(exec, host, ctx).await?;
        registry::trust(exec, host, ctx, registry).await?;
        exec.copy(host, &Self::pki_dir(ctx), REMOTE_PKI).await?;
        remote::copy_statics(exec, host, ctx).await?;

        self.run_join(
            host,
            ctx,
            version,
            host_port(master0, API_SERVER_PORT),
            Some(host),
        )
        .await?;

        // a joined master serves the API itself
        remote::ensure_hosts_entry(exec, host, host, API_SERVER_DOMAIN).await?;

        let name = exec.hostname(host).await?;
        let registered = exec
            .cmd(master0, &format!("{KUBECTL} get nodes -o name"))
            .await?;
        if !registered.lines().any(|l| l.trim() == format!("node/{name}")) {
            return Err(Error::internal_with_context(
                "join masters",
                format!("{host}: node {name} not registered after join"),
            ));
        }
        info!(host = %host, node = %name, "master joined");
        Ok(())
    }

    async fn join_node(
        &self,
        host: IpAddr,
        master0: IpAddr,
        ctx: &RuntimeContext,
        version: KubeVersion,
        registry: &RegistryConfig,
        manifest: &str,
    ) -> Result<()> {
        let exec = self.exec();
        remote::ensure_hosts_entry(exec, host, ctx.vip(), API_SERVER_DOMAIN).await?;
        remote::ensure_hosts_entry(exec, host, registry.host(master0), &registry.domain).await?;
        remote::bootstrap_host(exec, host, ctx).await?;
        registry::trust(exec, host, ctx, registry).await?;
        exec.cmd(host, &loadbalancer::ipvs_command(ctx)).await?;

        self.run_join(
            host,
            ctx,
            version,
            host_port(ctx.vip(), API_SERVER_PORT),
            None,
        )
        .await?;

        push_rendered(exec, host, ctx, manifest, LVSCARE_MANIFEST).await?;
        info!(host = %host, "node joined");
        Ok(())
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
                    "if command -v kubeadm >/dev/null 2>&1; then kubeadm reset -f; fi".to_string(),
                    "rm -rf /etc/kubernetes /var/lib/etcd /var/lib/kubelet /etc/cni/net.d $HOME/.kube"
                        .to_string(),
                    "ipvsadm -C >/dev/null 2>&1 || true".to_string(),
                    remove_hosts_entry_command(API_SERVER_DOMAIN),
                    remove_hosts_entry_command(&registry.domain),
                ],
            )
            .await?;
        remote::run_clean_script(self.exec(), host, ctx).await
    }

    async fn refresh_nodes(&self, ctx: &RuntimeContext, registry: &RegistryConfig) -> Result<()> {
        loadbalancer::refresh(
            self.exec(),
            ctx,
            &self.templates,
            &registry.address(),
            &self.cancel,
        )
        .await
    }
}

#[async_trait]
impl ClusterRuntime for KubeadmRuntime {
    fn flavor(&self) -> RuntimeFlavor {
        RuntimeFlavor::Kubeadm
    }

    async fn init(&self, ctx: RuntimeContext) -> Result<RuntimeContext> {
        let exec = self.exec();
        let master0 = ctx.require_master0()?;
        info!(master = %master0, "initialising control plane");

        wait_ready(exec, &[master0], &self.settings.ssh.ready_retry(), &self.cancel).await?;
        let (ctx, version) = self.resolve_version(ctx, master0).await?;

        remote::ensure_hosts_entry(exec, master0, master0, API_SERVER_DOMAIN).await?;
        let registry = registry::load(exec, master0, &ctx).await?;
        remote::ensure_hosts_entry(exec, master0, registry.host(master0), &registry.domain)
            .await?;
        remote::bootstrap_host(exec, master0, &ctx).await?;

        let config = self
            .render_init_config(&ctx, master0, version, &registry)
            .await?;
        let config_path = ctx.rootfs_path(INIT_CONFIG);
        push_rendered(exec, master0, &ctx, &config, &config_path).await?;

        let pki = self.local_pki(&ctx)?;
        exec.copy(master0, &Self::pki_dir(&ctx), REMOTE_PKI).await?;
        self.push_kubeconfigs(master0, &ctx, &pki).await?;
        remote::copy_statics(exec, master0, &ctx).await?;
        registry::ensure(exec, registry.host(master0), &ctx, &registry).await?;
        self.check_cancelled()?;

        let credentials = if exec.exists(master0, APISERVER_MANIFEST).await? {
            info!(master = %master0, "control plane already initialised");
            self.regenerate_credentials(master0, &ctx, version).await?
        } else {
            let out = exec
                .cmd(
                    master0,
                    &format!(
                        "kubeadm init --config={config_path} {} -v 0",
                        version.upload_certs_flag()
                    ),
                )
                .await?;
            let scanned = parse_join_command(&out)?;
            let discovery_hash = pki.discovery_hash()?;
            if discovery_hash != scanned.discovery_hash {
                warn!(
                    scanned = %scanned.discovery_hash,
                    local = %discovery_hash,
                    "init output reports a different CA hash, using the local CA"
                );
            }
            JoinCredentials::Kubeadm {
                token: scanned.token,
                discovery_hash,
                certificate_key: scanned.certificate_key,
            }
        };

        exec.fetch(master0, ADMIN_CONF, &ctx.local_dir().join("admin.conf"))
            .await?;
        exec.fetch(master0, "/usr/bin/kubectl", &ctx.local_dir().join("bin/kubectl"))
            .await?;

        info!(master = %master0, version = %version, "control plane initialised");
        Ok(ctx
            .with_credentials(credentials)
            .with_masters_joined(&[master0]))
    }

    async fn join_masters(&self, ctx: RuntimeContext, ips: &[IpAddr]) -> Result<RuntimeContext> {
        if ips.is_empty() {
            return Ok(ctx);
        }
        let exec = self.exec();
        let master0 = ctx.require_master0()?;
        wait_ready(exec, ips, &self.settings.ssh.ready_retry(), &self.cancel).await?;

        let (ctx, version) = self.resolve_version(ctx, master0).await?;
        self.local_pki(&ctx)?;
        let mut ctx = self.ensure_credentials(ctx, master0, version, true).await?;
        let registry = registry::load(exec, master0, &ctx).await?;

        for &host in ips {
            self.check_cancelled()?;
            info!(host = %host, "joining master");
            self.join_master(host, master0, &ctx, version, &registry)
                .await?;
            ctx = ctx.with_masters_joined(&[host]);
        }

        self.refresh_nodes(&ctx, &registry).await?;
        Ok(ctx)
    }

    async fn join_nodes(&self, ctx: RuntimeContext, ips: &[IpAddr]) -> Result<RuntimeContext> {
        if ips.is_empty() {
            return Ok(ctx);
        }
        let exec = self.exec();
        let master0 = ctx.require_master0()?;
        wait_ready(exec, ips, &self.settings.ssh.ready_retry(), &self.cancel).await?;

        let (ctx, version) = self.resolve_version(ctx, master0).await?;
        let ctx = self.ensure_credentials(ctx, master0, version, false).await?;
        let registry = registry::load(exec, master0, &ctx).await?;
        let manifest = loadbalancer::render_manifest(&self.templates, &ctx, &registry.address())?;

        info!(count = ips.len(), "joining nodes");
        run_on_hosts(ips, None, &self.cancel, |host| {
            let (ctx, registry, manifest) = (&ctx, &registry, manifest.as_str());
            async move {
                self.join_node(host, master0, ctx, version, registry, manifest)
                    .await
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
            self.check_cancelled()?;
            info!(host = %host, "deleting master");
            let name = exec.hostname(host).await?;
            self.reset_host(host, &ctx, &registry).await?;
            ctx = ctx.with_masters_removed(&[host]);
            remote::remove_node_object(exec, ctx.masters(), KUBECTL, &name).await?;
        }

        self.refresh_nodes(&ctx, &registry).await?;
        Ok(ctx)
    }

    async fn delete_nodes(&self, ctx: RuntimeContext, ips: &[IpAddr]) -> Result<RuntimeContext> {
        if ips.is_empty() {
            return Ok(ctx);
        }
        let exec = self.exec();
        let master0 = ctx.require_master0()?;
        let registry = registry::load(exec, master0, &ctx).await?;

        info!(count = ips.len(), "deleting nodes");
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
        info!(version = %version, "rolling upgrade");

        let mut masters = vec![master0];
        masters.extend(ctx.masters().iter().filter(|m| **m != master0));

        let steps = KubeadmUpgrade {
            exec: self.exec(),
            ctx: &ctx,
            master0,
            version,
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

        info!(nodes = ctx.nodes().len(), "resetting nodes");
        run_on_hosts(ctx.nodes(), None, &self.cancel, |host| {
            let (ctx, registry) = (&ctx, &registry);
            async move { self.reset_host(host, ctx, registry).await }
        })
        .await?;

        let mut masters = ctx.masters().to_vec();
        if !masters.contains(&master0) {
            masters.insert(0, master0);
        }
        info!(masters = masters.len(), "resetting masters");
        run_on_hosts(&masters, None, &self.cancel, |host| {
            let (ctx, registry) = (&ctx, &registry);
            async move { self.reset_host(host, ctx, registry).await }
        })
        .await?;

        registry::recycle(exec, registry.host(master0)).await?;
        Ok(ctx.emptied())
    }
}

struct KubeadmUpgrade<'a> {
    exec: &'a dyn RemoteExecutor,
    ctx: &'a RuntimeContext,
    master0: IpAddr,
    version: KubeVersion,
}

#[async_trait]
impl HostUpgrade for KubeadmUpgrade<'_> {
    async fn drain(&self, host: IpAddr) -> Result<()> {
        let name = self.exec.hostname(host).await?;
        let emptydir = if self.version.at_least(1, 20) {
            "--delete-emptydir-data"
        } else {
            "--delete-local-data"
        };
        self.exec
            .cmd(
                self.master0,
                &format!("{KUBECTL} drain {name} --ignore-daemonsets {emptydir} --force"),
            )
            .await?;
        Ok(())
    }

    async fn upgrade(&self, host: IpAddr, role: Role) -> Result<()> {
        let bin = |name: &str| {
            format!(
                "cp -f {} /usr/bin/{name}",
                self.ctx.rootfs_path(&format!("bin/{name}"))
            )
        };
        let upgrade = match role {
            Role::Master0 => format!("kubeadm upgrade apply -y {}", self.version),
            Role::Master | Role::Node => "kubeadm upgrade node".to_string(),
        };
        self.exec
            .cmd_async(
                host,
                &[bin("kubeadm"), upgrade, bin("kubelet"), bin("kubectl")],
            )
            .await
    }

    async fn restart(&self, host: IpAddr) -> Result<()> {
        self.exec
            .cmd(host, "systemctl daemon-reload && systemctl restart kubelet")
            .await?;
        Ok(())
    }

    async fn ready(&self, host: IpAddr) -> Result<bool> {
        let name = self.exec.hostname(host).await?;
        let out = self
            .exec
            .cmd(self.master0, &remote::node_ready_command(KUBECTL, &name))
            .await?;
        Ok(remote::node_ready(&out))
    }

    async fn uncordon(&self, host: IpAddr) -> Result<()> {
        let name = self.exec.hostname(host).await?;
        self.exec
            .cmd(self.master0, &format!("{KUBECTL} uncordon {name}"))
            .await?;
        Ok(())
    }
}
