//! Host-level steps shared by both runtime flavors.

use std::net::IpAddr;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use keel_common::{Error, Result};
use keel_ssh::shell::quote;
use keel_ssh::RemoteExecutor;

use crate::context::RuntimeContext;

/// Static files copied into `/etc/kubernetes` before init and join.
pub const STATICS_DIR: &str = "statics";

/// Host teardown script, relative to the rootfs.
pub const CLEAN_SCRIPT: &str = "scripts/clean.sh";

/// Command that makes `/etc/hosts` map `domain` to `ip`.
///
/// A no-op when the exact entry is present; any other mapping for the
/// domain is replaced.
pub fn hosts_entry_command(ip: IpAddr, domain: &str) -> String {
    let entry = format!("{ip} {domain}");
    format!(
        "grep -qx {entry_q} /etc/hosts || (sed -i {del} /etc/hosts && echo {entry_q} >> /etc/hosts)",
        entry_q = quote(&entry),
        del = quote(&delete_expr(domain)),
    )
}

/// Command that drops any `/etc/hosts` mapping for `domain`.
pub fn remove_hosts_entry_command(domain: &str) -> String {
    format!("sed -i {} /etc/hosts", quote(&delete_expr(domain)))
}

fn delete_expr(domain: &str) -> String {
    format!("/[[:space:]]{}$/d", domain.replace('.', "\\."))
}

/// Map `domain` to `ip` in the host's `/etc/hosts`.
pub async fn ensure_hosts_entry(
    exec: &dyn RemoteExecutor,
    host: IpAddr,
    ip: IpAddr,
    domain: &str,
) -> Result<()> {
    exec.cmd(host, &hosts_entry_command(ip, domain)).await?;
    Ok(())
}

/// Run the rootfs init script (container runtime, kubelet, binaries).
pub async fn bootstrap_host(
    exec: &dyn RemoteExecutor,
    host: IpAddr,
    ctx: &RuntimeContext,
) -> Result<()> {
    info!(host = %host, "bootstrapping host");
    exec.cmd_async(
        host,
        &[format!("cd {} && sh init.sh", quote(&ctx.rootfs_path("scripts")))],
    )
    .await
}

/// Copy the rootfs static files into `/etc/kubernetes`.
pub async fn copy_statics(
    exec: &dyn RemoteExecutor,
    host: IpAddr,
    ctx: &RuntimeContext,
) -> Result<()> {
    let statics = quote(&ctx.rootfs_path(STATICS_DIR));
    exec.cmd(
        host,
        &format!(
            "if [ -d {statics} ]; then mkdir -p /etc/kubernetes && cp -rf {statics}/. /etc/kubernetes/; fi"
        ),
    )
    .await?;
    Ok(())
}

/// Run the rootfs clean script when the image ships one.
pub async fn run_clean_script(
    exec: &dyn RemoteExecutor,
    host: IpAddr,
    ctx: &RuntimeContext,
) -> Result<()> {
    let script = ctx.rootfs_path(CLEAN_SCRIPT);
    if exec.exists(host, &script).await? {
        exec.cmd_async(
            host,
            &[format!(
                "cd {} && sh clean.sh",
                quote(&ctx.rootfs_path("scripts"))
            )],
        )
        .await?;
    }
    Ok(())
}

/// Write `contents` locally under the context's state directory and copy it
/// to `dst` on `host`.
///
/// The local copy is kept per host so concurrent pushes do not collide.
pub async fn push_rendered(
    exec: &dyn RemoteExecutor,
    host: IpAddr,
    ctx: &RuntimeContext,
    contents: &str,
    dst: &str,
) -> Result<PathBuf> {
    let name = dst.rsplit('/').next().unwrap_or(dst);
    let local = ctx
        .local_dir()
        .join("rendered")
        .join(host.to_string())
        .join(name);
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
    }
    tokio::fs::write(&local, contents)
        .await
        .map_err(|e| Error::io(format!("write {}", local.display()), e))?;
    debug!(host = %host, dst, "pushing rendered file");
    exec.copy(host, &local, dst).await?;
    Ok(local)
}

/// Whether `kubectl get node -o jsonpath=<Ready status>` reported `True`.
pub fn node_ready(output: &str) -> bool {
    output.trim().trim_matches('\'') == "True"
}

/// `kubectl` invocation printing a node's Ready condition.
pub fn node_ready_command(kubectl: &str, node: &str) -> String {
    format!(
        "{kubectl} get node {} -o jsonpath='{{.status.conditions[?(@.type==\"Ready\")].status}}'",
        quote(node)
    )
}

/// Delete a node object through the first reachable master.
///
/// Returns `Ok(false)` when no master answered; the node object is then
/// left for the operator.
pub async fn remove_node_object(
    exec: &dyn RemoteExecutor,
    masters: &[IpAddr],
    kubectl: &str,
    node: &str,
) -> Result<bool> {
    for &master in masters {
        if let Err(e) = exec.ping(master).await {
            debug!(master = %master, error = %e, "master unreachable, trying next");
            continue;
        }
        exec.cmd(
            master,
            &format!("{kubectl} delete node {} --ignore-not-found", quote(node)),
        )
        .await?;
        info!(node, via = %master, "node object deleted");
        return Ok(true);
    }
    warn!(node, "no reachable master left to delete node object");
    Ok(false)
}
