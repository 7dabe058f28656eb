//! CLI commands.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use keel_apply::{Applier, Plan};
use keel_common::settings::{self, Settings};
use keel_common::store::ClusterStore;
use keel_common::ClusterSpec;
use keel_ssh::{CancellationToken, RemoteExecutor, SshExecutor};

use crate::{Error, GlobalArgs, Result};

pub mod apply;
pub mod delete;
pub mod scale;

/// Settings from `--config` (or the default path), with CLI overrides applied.
pub fn load_settings(global: &GlobalArgs) -> Result<Settings> {
    let path = global
        .config
        .clone()
        .unwrap_or_else(settings::default_config_path);
    let mut settings = Settings::load(&path)?;
    debug!(path = %path.display(), "loaded settings");
    if let Some(data_dir) = &global.data_dir {
        settings.data_dir = data_dir.clone();
    }
    Ok(settings)
}

/// Recorded document of a cluster that was applied before.
pub fn recorded_cluster(settings: &Settings, name: &str) -> Result<ClusterSpec> {
    ClusterStore::new(&settings.state_dir)
        .load(name)?
        .ok_or_else(|| Error::ClusterNotFound {
            name: name.to_string(),
        })
}

/// Read and parse a cluster file.
pub fn read_cluster_file(path: &Path) -> Result<ClusterSpec> {
    let raw = std::fs::read_to_string(path).map_err(|e| Error::ClusterFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(ClusterSpec::from_yaml(&raw)?)
}

/// Token cancelled on the first Ctrl-C.
pub fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping in-flight work");
            token.cancel();
        }
    });
    cancel
}

/// Applier reaching the cluster's hosts with its own SSH credentials.
pub fn applier_for(cluster: &ClusterSpec, settings: Settings, cancel: CancellationToken) -> Applier {
    let exec: Arc<dyn RemoteExecutor> =
        Arc::new(SshExecutor::new(cluster.spec.ssh.clone(), &settings.ssh));
    Applier::new(settings, exec, cancel)
}

/// Print what a pass did.
pub fn report(cluster: &str, plan: &Plan) {
    if plan.is_empty() {
        println!("cluster {cluster} is up to date");
    } else {
        println!("cluster {cluster}: {plan}");
    }
}
