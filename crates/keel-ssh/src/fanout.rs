//! Per-host fan-out and fan-in.
//!
//! One future per host, all polled together. A failing host does not stop
//! its siblings: every host runs to completion and the first error (in host
//! order) is returned after all are joined. Cancellation is the only thing
//! that cuts work short; dropping an in-flight ssh future kills its process.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use keel_common::retry::{retry_with_backoff, RetryConfig};
use keel_common::{Error, Result};

use crate::executor::RemoteExecutor;

/// Run `work` once per host and collect results in host order.
///
/// `limit` caps how many hosts run at once; `None` runs all of them
/// together. Hosts waiting for a permit or still running when `cancel`
/// fires finish with [`Error::Cancelled`].
pub async fn run_on_hosts<T, F, Fut>(
    hosts: &[IpAddr],
    limit: Option<usize>,
    cancel: &CancellationToken,
    work: F,
) -> Result<Vec<T>>
where
    F: Fn(IpAddr) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let semaphore = limit.map(|n| Arc::new(Semaphore::new(n.max(1))));

    let tasks = hosts.iter().map(|&host| {
        let semaphore = semaphore.clone();
        let fut = work(host);
        async move {
            let _permit = match &semaphore {
                Some(semaphore) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return (host, Err(Error::Cancelled)),
                    permit = semaphore.acquire() => match permit {
                        Ok(permit) => Some(permit),
                        Err(e) => {
                            return (host, Err(Error::internal_with_context("fanout", e.to_string())))
                        }
                    },
                },
                None => None,
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = fut => result,
            };
            (host, result)
        }
    });

    let results = join_all(tasks).await;

    let mut values = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for (host, result) in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => {
                if !matches!(e, Error::Cancelled) {
                    error!(host = %host, error = %e, "host failed");
                }
                errors.push(e);
            }
        }
    }

    if errors.is_empty() {
        Ok(values)
    } else {
        Err(errors.swap_remove(0))
    }
}

/// Wait until every host answers a ping.
///
/// Hosts are pinged concurrently with the given (linear) retry policy. A slow
/// host never cuts its siblings short; once all have settled the first host
/// that never answered is reported.
pub async fn wait_ready(
    executor: &dyn RemoteExecutor,
    hosts: &[IpAddr],
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    run_on_hosts(hosts, None, cancel, |host| async move {
        let name = format!("ssh ping {host}");
        retry_with_backoff(retry, &name, || executor.ping(host))
            .await
            .map_err(|e| match e {
                Error::Cancelled => Error::Cancelled,
                _ => Error::ReadinessTimeout {
                    host: host.to_string(),
                    attempts: retry.max_attempts,
                },
            })?;
        debug!(host = %host, "ssh ready");
        Ok(())
    })
    .await
    .map(|_| ())
}
