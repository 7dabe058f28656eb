//! Common types for keel: the cluster document, errors, and utilities.

#![deny(missing_docs)]

pub mod cluster;
pub mod error;
pub mod hosts;
pub mod retry;
pub mod settings;
pub mod store;
pub mod telemetry;

pub use cluster::{ClusterCurrent, ClusterSpec, Hosts, ProviderKind, RuntimeFlavor};
pub use error::Error;
pub use hosts::{diff, HostDiff};

/// Result type alias using our custom Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Port the API server listens on for every master.
pub const API_SERVER_PORT: u16 = 6443;

/// Virtual IP that worker-side load balancers expose for the API server.
pub const DEFAULT_VIP: &str = "10.103.97.2";

/// DNS name every host resolves to reach the API server.
pub const API_SERVER_DOMAIN: &str = "apiserver.cluster.local";

/// Name of the persisted cluster document inside a cluster state directory.
pub const CLUSTERFILE_NAME: &str = "Clusterfile";
