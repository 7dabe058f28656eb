//! Private image registry served from the bootstrap master.

use std::net::IpAddr;

use serde::Deserialize;
use tracing::{debug, info};

use keel_common::{Error, Result};
use keel_ssh::shell::quote;
use keel_ssh::RemoteExecutor;

use crate::context::RuntimeContext;

/// Registry container name.
pub const CONTAINER: &str = "keel-registry";

/// Registry settings file, relative to the rootfs.
pub const CONFIG_FILE: &str = "etc/registry.yml";

/// Where the registry listens and under which name hosts reach it.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Host running the registry; master0 when unset.
    pub ip: Option<IpAddr>,
    /// DNS name hosts use for the registry.
    pub domain: String,
    /// Listen port.
    pub port: u16,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ip: None,
            domain: "keel.hub".to_string(),
            port: 5000,
        }
    }
}

impl RegistryConfig {
    /// Parse `registry.yml`; empty input gives the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| Error::parse(CONFIG_FILE, e.to_string()))
    }

    /// `domain:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.domain, self.port)
    }

    /// Host running the registry.
    pub fn host(&self, master0: IpAddr) -> IpAddr {
        self.ip.unwrap_or(master0)
    }

    /// Docker trust directory for the registry's certificate.
    pub fn cert_dir(&self) -> String {
        format!("/etc/docker/certs.d/{}", self.address())
    }
}

/// Read the registry settings from the rootfs on `host`.
pub async fn load(
    exec: &dyn RemoteExecutor,
    host: IpAddr,
    ctx: &RuntimeContext,
) -> Result<RegistryConfig> {
    let path = ctx.rootfs_path(CONFIG_FILE);
    let raw = exec
        .cmd(host, &format!("cat {} 2>/dev/null || true", quote(&path)))
        .await?;
    RegistryConfig::from_yaml(&raw)
}

/// Start the registry on `host` unless its container is already running.
pub async fn ensure(
    exec: &dyn RemoteExecutor,
    host: IpAddr,
    ctx: &RuntimeContext,
    config: &RegistryConfig,
) -> Result<()> {
    let running = exec
        .cmd(host, &format!("docker ps -q -f name={CONTAINER}"))
        .await?;
    if !running.trim().is_empty() {
        debug!(host = %host, "registry already running");
        return Ok(());
    }
    info!(host = %host, registry = %config.address(), "starting registry");
    exec.cmd_async(
        host,
        &[format!(
            "cd {} && sh init-registry.sh {} {} {}",
            quote(&ctx.rootfs_path("scripts")),
            config.port,
            quote(&ctx.rootfs_path("registry")),
            quote(&config.domain)
        )],
    )
    .await
}

/// Trust the registry certificate shipped in the rootfs, if any.
pub async fn trust(
    exec: &dyn RemoteExecutor,
    host: IpAddr,
    ctx: &RuntimeContext,
    config: &RegistryConfig,
) -> Result<()> {
    let cert = quote(&ctx.rootfs_path(&format!("certs/{}.crt", config.domain)));
    let dir = quote(&config.cert_dir());
    exec.cmd(
        host,
        &format!("if [ -f {cert} ]; then mkdir -p {dir} && cp -f {cert} {dir}/ca.crt; fi"),
    )
    .await?;
    Ok(())
}

/// Remove the registry container.
pub async fn recycle(exec: &dyn RemoteExecutor, host: IpAddr) -> Result<()> {
    exec.cmd(host, &format!("docker rm -f {CONTAINER} || true"))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keel_common::settings::Settings;
    use keel_common::ClusterSpec;
    use keel_ssh::testing::ScriptedExecutor;

    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn ctx() -> RuntimeContext {
        let spec = ClusterSpec::new("prod", "kubernetes:v1.22.15", vec![ip("10.0.0.1")], vec![]);
        RuntimeContext::new(Arc::new(spec), &Settings::default(), vec![], vec![])
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = RegistryConfig::from_yaml("").unwrap();
        assert_eq!(defaults.address(), "keel.hub:5000");
        assert_eq!(defaults.host(ip("10.0.0.1")), ip("10.0.0.1"));

        let custom = RegistryConfig::from_yaml("ip: 10.0.0.9\ndomain: hub.internal\n").unwrap();
        assert_eq!(custom.address(), "hub.internal:5000");
        assert_eq!(custom.host(ip("10.0.0.1")), ip("10.0.0.9"));
        assert_eq!(custom.cert_dir(), "/etc/docker/certs.d/hub.internal:5000");

        assert!(RegistryConfig::from_yaml("port: [").is_err());
    }

    #[tokio::test]
    async fn ensure_is_a_noop_when_running() {
        let exec = ScriptedExecutor::new();
        exec.on("docker ps", "4f2a9c\n");
        let host = ip("10.0.0.1");

        ensure(&exec, host, &ctx(), &RegistryConfig::default())
            .await
            .unwrap();
        assert_eq!(exec.commands_on(host), vec!["docker ps -q -f name=keel-registry"]);
    }

    #[tokio::test]
    async fn ensure_starts_registry_from_rootfs() {
        let exec = ScriptedExecutor::new();
        let host = ip("10.0.0.1");

        ensure(&exec, host, &ctx(), &RegistryConfig::default())
            .await
            .unwrap();
        assert_eq!(
            exec.commands_on(host)[1],
            "cd /var/lib/keel/prod/rootfs/scripts && sh init-registry.sh 5000 /var/lib/keel/prod/rootfs/registry keel.hub"
        );
    }
}
