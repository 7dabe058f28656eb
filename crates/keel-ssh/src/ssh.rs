//! Process-backed executor using the system `ssh` and `scp` binaries.
//!
//! Each call spawns its own ssh process, so concurrent calls against many
//! hosts never share a connection. Password logins go through `sshpass -e`
//! with the secret passed in the environment, never on the command line.

use std::net::IpAddr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use keel_common::cluster::SshCredentials;
use keel_common::settings::SshSettings;
use keel_common::{Error, Result};

use crate::checksum::{self, Digests};
use crate::executor::RemoteExecutor;
use crate::shell;

/// ssh reserves this exit status for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Lines of stderr kept for error messages from streamed commands.
const STDERR_TAIL_LINES: usize = 20;

/// Executor that shells out to OpenSSH.
#[derive(Clone, Debug)]
pub struct SshExecutor {
    creds: SshCredentials,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshExecutor {
    /// Create an executor for one set of credentials.
    pub fn new(creds: SshCredentials, settings: &SshSettings) -> Self {
        Self {
            creds,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            command_timeout: settings.command_timeout(),
        }
    }

    fn base_command(&self, program: &str) -> Command {
        let mut cmd = match (&self.creds.passwd, &self.creds.pk_passwd) {
            (Some(secret), _) if self.creds.pk.is_none() => {
                let mut c = Command::new("sshpass");
                c.arg("-e").env("SSHPASS", secret).arg(program);
                c
            }
            (_, Some(passphrase)) => {
                let mut c = Command::new("sshpass");
                c.args(["-P", "passphrase", "-e"])
                    .env("SSHPASS", passphrase)
                    .arg(program);
                c
            }
            _ => Command::new(program),
        };
        cmd.args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
            "-o",
        ])
        .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()));
        if self.creds.passwd.is_none() && self.creds.pk_passwd.is_none() {
            cmd.args(["-o", "BatchMode=yes"]);
        }
        if let Some(pk) = &self.creds.pk {
            cmd.arg("-i").arg(pk);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn ssh(&self, host: IpAddr, command: &str) -> Command {
        let mut cmd = self.base_command("ssh");
        cmd.arg("-p")
            .arg(self.creds.port.to_string())
            .arg(format!("{}@{}", self.creds.user, host))
            .arg(shell::elevate(&self.creds.user, command));
        cmd
    }

    fn scp(&self) -> Command {
        let mut cmd = self.base_command("scp");
        cmd.arg("-P").arg(self.creds.port.to_string());
        cmd
    }

    fn remote_target(&self, host: IpAddr, path: &str) -> String {
        match host {
            IpAddr::V4(_) => format!("{}@{}:{}", self.creds.user, host, path),
            IpAddr::V6(_) => format!("{}@[{}]:{}", self.creds.user, host, path),
        }
    }

    async fn run_transfer(&self, host: IpAddr, path: &str, mut cmd: Command) -> Result<()> {
        let output = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| {
                Error::transfer(host, path, format!("timed out after {:?}", self.command_timeout))
            })?
            .map_err(|e| Error::transfer(host, path, format!("failed to execute scp: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::transfer(
                host,
                path,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn remote_digests(&self, host: IpAddr, path: &str, is_dir: bool) -> Result<Digests> {
        let out = self
            .cmd(host, &checksum::remote_digest_command(path, is_dir))
            .await?;
        Ok(checksum::parse_sha256sum(&out))
    }
}

fn exit_error(host: IpAddr, command: &str, status: Option<i32>, output: String) -> Error {
    match status {
        Some(SSH_TRANSPORT_FAILURE) => Error::connectivity(host, output.trim()),
        Some(code) => Error::remote_command(host, command, code, output),
        None => Error::remote_command(host, command, -1, output),
    }
}

async fn local_digests(path: &Path) -> Result<Digests> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || checksum::digest_local(&path))
        .await
        .map_err(|e| Error::internal_with_context("checksum", e.to_string()))?
}

fn verify(host: IpAddr, path: &str, local: &Digests, remote: &Digests) -> Result<()> {
    match checksum::first_mismatch(local, remote) {
        None => Ok(()),
        Some((file, local, remote)) => Err(Error::Checksum {
            host: host.to_string(),
            path: if file == "." {
                path.to_string()
            } else {
                format!("{}/{}", path.trim_end_matches('/'), file.trim_start_matches("./"))
            },
            local,
            remote,
        }),
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn ping(&self, host: IpAddr) -> Result<()> {
        let mut cmd = self.ssh(host, "true");
        let output = tokio::time::timeout(self.connect_timeout * 2, cmd.output())
            .await
            .map_err(|_| Error::connectivity(host, "ping timed out"))?
            .map_err(|e| Error::connectivity(host, format!("failed to execute ssh: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::connectivity(
                host,
                String::from_utf8_lossy(&output.stderr).trim(),
            ))
        }
    }

    async fn cmd(&self, host: IpAddr, command: &str) -> Result<String> {
        debug!(host = %host, command = %command, "running remote command");
        let mut cmd = self.ssh(host, command);
        let output = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| {
                Error::remote_command(
                    host,
                    command,
                    -1,
                    format!("timed out after {:?}", self.command_timeout),
                )
            })?
            .map_err(|e| Error::connectivity(host, format!("failed to execute ssh: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            debug!(host = %host, output = %stdout.trim(), "remote command finished");
            return Ok(stdout);
        }
        let combined = format!("{}{}", stdout, String::from_utf8_lossy(&output.stderr));
        Err(exit_error(host, command, output.status.code(), combined))
    }

    async fn cmd_async(&self, host: IpAddr, commands: &[String]) -> Result<()> {
        for command in commands {
            info!(host = %host, command = %command, "running remote command");
            let mut cmd = self.ssh(host, command);
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            let mut child = cmd
                .spawn()
                .map_err(|e| Error::connectivity(host, format!("failed to execute ssh: {e}")))?;

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();

            let stream_stdout = async {
                if let Some(stdout) = stdout {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        info!(host = %host, "{}", line);
                    }
                }
            };
            let collect_stderr = async {
                let mut tail: Vec<String> = Vec::new();
                if let Some(stderr) = stderr {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        info!(host = %host, "{}", line);
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.remove(0);
                        }
                        tail.push(line);
                    }
                }
                tail
            };

            let run = async {
                let ((), tail) = tokio::join!(stream_stdout, collect_stderr);
                let status = child.wait().await;
                (status, tail)
            };
            let (status, tail) = tokio::time::timeout(self.command_timeout, run)
                .await
                .map_err(|_| {
                    Error::remote_command(
                        host,
                        command.as_str(),
                        -1,
                        format!("timed out after {:?}", self.command_timeout),
                    )
                })?;
            let status = status
                .map_err(|e| Error::connectivity(host, format!("failed to wait for ssh: {e}")))?;
            if !status.success() {
                return Err(exit_error(host, command, status.code(), tail.join("\n")));
            }
        }
        Ok(())
    }

    async fn copy(&self, host: IpAddr, src: &Path, dst: &str) -> Result<()> {
        let is_dir = src.is_dir();
        if !is_dir && !src.is_file() {
            return Err(Error::transfer(
                host,
                dst,
                format!("local source {} does not exist", src.display()),
            ));
        }

        let parent = Path::new(dst)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());
        let mut prepare = format!("mkdir -p {}", shell::quote(&parent));
        if is_dir {
            prepare = format!("rm -rf {} && {}", shell::quote(dst), prepare);
        }
        self.cmd(host, &prepare).await?;

        let mut cmd = self.scp();
        if is_dir {
            cmd.arg("-r");
        }
        cmd.arg(src).arg(self.remote_target(host, dst));
        debug!(host = %host, src = %src.display(), dst = %dst, "copying");
        self.run_transfer(host, dst, cmd).await?;

        let local = local_digests(src).await?;
        let remote = self.remote_digests(host, dst, is_dir).await?;
        verify(host, dst, &local, &remote)
    }

    async fn fetch(&self, host: IpAddr, src: &str, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
        }

        let mut cmd = self.scp();
        cmd.arg(self.remote_target(host, src)).arg(dst);
        debug!(host = %host, src = %src, dst = %dst.display(), "fetching");
        self.run_transfer(host, src, cmd).await?;

        let remote = self.remote_digests(host, src, false).await?;
        let local = local_digests(dst).await?;
        verify(host, src, &local, &remote)
    }
}
