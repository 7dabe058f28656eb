//! Remote execution for keel.
//!
//! Everything that touches a host goes through [`RemoteExecutor`]. The
//! fan-out helpers in [`fanout`] run one unit of work per host, optionally
//! capped by a semaphore, and stop promptly when the shared cancellation
//! token fires.

#![deny(missing_docs)]

pub mod checksum;
pub mod executor;
pub mod fanout;
pub mod shell;
pub mod ssh;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use executor::RemoteExecutor;
pub use fanout::{run_on_hosts, wait_ready};
pub use ssh::SshExecutor;

pub use tokio_util::sync::CancellationToken;
