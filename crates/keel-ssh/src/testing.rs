//! Scripted executor for tests in this and dependent crates.
//!
//! Records every call and answers commands from substring rules, so tests
//! can assert on the exact remote command sequence per host.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use keel_common::{Error, Result};

use crate::executor::RemoteExecutor;

/// One recorded call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    /// Liveness check.
    Ping(IpAddr),
    /// `cmd` or one command of `cmd_async`.
    Cmd(IpAddr, String),
    /// Upload.
    Copy(IpAddr, PathBuf, String),
    /// Download.
    Fetch(IpAddr, String, PathBuf),
}

struct Rule {
    host: Option<IpAddr>,
    needle: String,
    reply: std::result::Result<String, (i32, String)>,
}

/// In-memory [`RemoteExecutor`].
///
/// Unmatched commands succeed with empty output. Later rules take
/// precedence over earlier ones.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
    unreachable: Mutex<HashSet<IpAddr>>,
    files: Mutex<HashMap<String, String>>,
}

impl ScriptedExecutor {
    /// Empty script: everything succeeds silently.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer any command containing `needle` with `output`.
    pub fn on(&self, needle: &str, output: &str) -> &Self {
        self.push(None, needle, Ok(output.to_string()))
    }

    /// Answer commands containing `needle` on one host.
    pub fn on_host(&self, host: IpAddr, needle: &str, output: &str) -> &Self {
        self.push(Some(host), needle, Ok(output.to_string()))
    }

    /// Fail commands containing `needle` on one host.
    pub fn fail_on(&self, host: IpAddr, needle: &str, status: i32, output: &str) -> &Self {
        self.push(Some(host), needle, Err((status, output.to_string())))
    }

    /// Make every call against `host` a connectivity failure.
    pub fn unreachable(&self, host: IpAddr) -> &Self {
        lock(&self.unreachable).insert(host);
        self
    }

    /// Content returned by `fetch` for a remote path.
    pub fn serve_file(&self, remote: &str, contents: &str) -> &Self {
        lock(&self.files).insert(remote.to_string(), contents.to_string());
        self
    }

    fn push(
        &self,
        host: Option<IpAddr>,
        needle: &str,
        reply: std::result::Result<String, (i32, String)>,
    ) -> &Self {
        lock(&self.rules).push(Rule {
            host,
            needle: needle.to_string(),
            reply,
        });
        self
    }

    /// Every call so far.
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    /// Commands run on one host, in order.
    pub fn commands_on(&self, host: IpAddr) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                Call::Cmd(h, cmd) if *h == host => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every command on every host, in order.
    pub fn all_commands(&self) -> Vec<(IpAddr, String)> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                Call::Cmd(h, cmd) => Some((*h, cmd.clone())),
                _ => None,
            })
            .collect()
    }

    /// Hosts that saw at least one command containing `needle`.
    pub fn hosts_running(&self, needle: &str) -> Vec<IpAddr> {
        let mut hosts = Vec::new();
        for (host, cmd) in self.all_commands() {
            if cmd.contains(needle) && !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        hosts
    }

    /// Remote destinations copied to one host.
    pub fn copies_to(&self, host: IpAddr) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                Call::Copy(h, _, dst) if *h == host => Some(dst.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        lock(&self.calls).push(call);
    }

    fn reachable(&self, host: IpAddr) -> Result<()> {
        if lock(&self.unreachable).contains(&host) {
            Err(Error::connectivity(host, "scripted unreachable"))
        } else {
            Ok(())
        }
    }

    fn answer(&self, host: IpAddr, command: &str) -> Result<String> {
        let rules = lock(&self.rules);
        let rule = rules
            .iter()
            .rev()
            .find(|r| r.host.map_or(true, |h| h == host) && command.contains(&r.needle));
        match rule.map(|r| &r.reply) {
            None => Ok(String::new()),
            Some(Ok(out)) => Ok(out.clone()),
            Some(Err((status, out))) => {
                Err(Error::remote_command(host, command, *status, out.clone()))
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn ping(&self, host: IpAddr) -> Result<()> {
        self.record(Call::Ping(host));
        self.reachable(host)
    }

    async fn cmd(&self, host: IpAddr, command: &str) -> Result<String> {
        self.reachable(host)?;
        self.record(Call::Cmd(host, command.to_string()));
        self.answer(host, command)
    }

    async fn cmd_async(&self, host: IpAddr, commands: &[String]) -> Result<()> {
        for command in commands {
            self.cmd(host, command).await?;
        }
        Ok(())
    }

    async fn copy(&self, host: IpAddr, src: &Path, dst: &str) -> Result<()> {
        self.reachable(host)?;
        self.record(Call::Copy(host, src.to_path_buf(), dst.to_string()));
        Ok(())
    }

    async fn fetch(&self, host: IpAddr, src: &str, dst: &Path) -> Result<()> {
        self.reachable(host)?;
        self.record(Call::Fetch(host, src.to_string(), dst.to_path_buf()));
        let contents = lock(&self.files).get(src).cloned().unwrap_or_default();
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
        }
        std::fs::write(dst, contents).map_err(|e| Error::io(format!("write {}", dst.display()), e))
    }
}
