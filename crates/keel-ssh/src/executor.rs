//! The remote execution seam.

use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use keel_common::Result;

use crate::shell;

/// Commands and file transfers against a single host.
///
/// Implementations do not retry. Connectivity is retried only by
/// [`crate::wait_ready`]; a command that fails is reported immediately with
/// the host and command text attached.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Cheap liveness check.
    async fn ping(&self, host: IpAddr) -> Result<()>;

    /// Run one command and return its standard output.
    ///
    /// A non-zero exit becomes [`keel_common::Error::RemoteCommand`] carrying
    /// the combined stdout and stderr.
    async fn cmd(&self, host: IpAddr, command: &str) -> Result<String>;

    /// Run commands in order, streaming output line by line to the log.
    ///
    /// Stops at the first command that fails.
    async fn cmd_async(&self, host: IpAddr, commands: &[String]) -> Result<()>;

    /// Copy a local file or directory to `dst` and verify checksums.
    ///
    /// Directory copies replace `dst`.
    async fn copy(&self, host: IpAddr, src: &Path, dst: &str) -> Result<()>;

    /// Copy a remote file to `dst` and verify checksums.
    async fn fetch(&self, host: IpAddr, src: &str, dst: &Path) -> Result<()>;

    /// Whether a remote path exists.
    async fn exists(&self, host: IpAddr, path: &str) -> Result<bool> {
        let out = self
            .cmd(
                host,
                &format!("if [ -e {} ]; then echo yes; else echo no; fi", shell::quote(path)),
            )
            .await?;
        Ok(out.trim() == "yes")
    }

    /// Remote hostname, lower-cased as the node object name.
    async fn hostname(&self, host: IpAddr) -> Result<String> {
        let out = self.cmd(host, "hostname").await?;
        Ok(out.trim().to_lowercase())
    }
}
