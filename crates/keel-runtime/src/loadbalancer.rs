//! Worker-side API load balancing.
//!
//! Workers reach the API server through a virtual IP. Before kubelet starts,
//! a one-shot IPVS rule from the rootfs helper points the VIP at the
//! masters; afterwards the lvscare static pod keeps that rule in sync with
//! master health.

use std::net::IpAddr;

use tokio_util::sync::CancellationToken;
use tracing::info;

use keel_common::{Result, API_SERVER_PORT};
use keel_ssh::{run_on_hosts, RemoteExecutor};

use crate::context::RuntimeContext;
use crate::remote::push_rendered;
use crate::templates::{host_port, LvscareValues, TemplateEngine, LVSCARE_POD};

/// Static pod manifest path on every node.
pub const LVSCARE_MANIFEST: &str = "/etc/kubernetes/manifests/kube-lvscare.yaml";

/// lvscare image name inside the private registry.
pub const LVSCARE_IMAGE: &str = "keel/lvscare:latest";

/// `master:6443` for each master.
pub fn real_servers(masters: &[IpAddr]) -> Vec<String> {
    masters
        .iter()
        .map(|m| host_port(*m, API_SERVER_PORT))
        .collect()
}

/// One-shot IPVS rule for the VIP, run on a node before it joins.
pub fn ipvs_command(ctx: &RuntimeContext) -> String {
    let mut cmd = format!(
        "{} ipvs --vs {}",
        ctx.rootfs_path("bin/keel-util"),
        host_port(ctx.vip(), API_SERVER_PORT)
    );
    for rs in real_servers(ctx.masters()) {
        cmd.push_str(" --rs ");
        cmd.push_str(&rs);
    }
    cmd.push_str(" --health-path /healthz --health-schem https --run-once");
    cmd
}

/// Render the lvscare manifest for the context's masters.
pub fn render_manifest(
    engine: &TemplateEngine,
    ctx: &RuntimeContext,
    registry: &str,
) -> Result<String> {
    Ok(engine.render(
        LVSCARE_POD,
        &LvscareValues {
            image: format!("{registry}/{LVSCARE_IMAGE}"),
            virtual_server: host_port(ctx.vip(), API_SERVER_PORT),
            real_servers: real_servers(ctx.masters()),
        },
    )?)
}

/// Install the IPVS rule and lvscare manifest on one node.
pub async fn install(
    exec: &dyn RemoteExecutor,
    host: IpAddr,
    ctx: &RuntimeContext,
    manifest: &str,
) -> Result<()> {
    exec.cmd(host, &ipvs_command(ctx)).await?;
    push_rendered(exec, host, ctx, manifest, LVSCARE_MANIFEST).await?;
    Ok(())
}

/// Point every node in the context at the context's current masters.
pub async fn refresh(
    exec: &dyn RemoteExecutor,
    ctx: &RuntimeContext,
    engine: &TemplateEngine,
    registry: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    if ctx.nodes().is_empty() {
        return Ok(());
    }
    let manifest = render_manifest(engine, ctx, registry)?;
    info!(
        nodes = ctx.nodes().len(),
        masters = ctx.masters().len(),
        "refreshing load balancer targets"
    );
    run_on_hosts(ctx.nodes(), None, cancel, |host| {
        let manifest = &manifest;
        async move { install(exec, host, ctx, manifest).await }
    })
    .await?;
    Ok(())
}
