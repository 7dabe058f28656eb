//! Reconciliation for keel clusters.
//!
//! [`Applier`] is the entry point: it resolves the desired document against
//! the recorded and observed state, asks [`plan::plan`] for an ordered
//! [`Plan`], and hands it to the [`ActionPipeline`]. Everything outside the
//! node lifecycle (images, rootfs, hooks, observation) sits behind the
//! traits in [`collaborators`].

#![deny(missing_docs)]

pub mod applier;
pub mod collaborators;
pub mod hooks;
pub mod image;
pub mod observe;
pub mod pipeline;
pub mod plan;
pub mod provision;
pub mod rootfs;
pub mod scale;
pub mod validate;

pub use applier::{Applier, Collaborators};
pub use pipeline::ActionPipeline;
pub use plan::{Action, Plan, Reconciliation};
pub use scale::{ScaleRole, ScaleTarget, ScaleValue};
