//! Node lifecycle for keel.
//!
//! [`ClusterRuntime`] is the lifecycle contract (init, join, delete, upgrade,
//! reset). Two backends implement it: [`kubeadm::KubeadmRuntime`] and
//! [`k0s::K0sRuntime`]; [`runtime_for`] picks one from the cluster's flavor.
//! Every step takes a [`RuntimeContext`] and returns the next one.

#![deny(missing_docs)]

pub mod context;
pub mod join_output;
pub mod k0s;
pub mod kubeadm;
pub mod lifecycle;
pub mod loadbalancer;
pub mod metadata;
pub mod pki;
pub mod registry;
pub mod remote;
pub mod templates;
pub mod upgrade;
pub mod version;

pub use context::{JoinCredentials, RuntimeContext};
pub use lifecycle::{runtime_for, ClusterRuntime};
pub use version::KubeVersion;
