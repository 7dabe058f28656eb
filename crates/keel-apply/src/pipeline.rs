//! Action pipeline.
//!
//! Runs a [`Plan`] front to back. Each action receives the context the
//! previous one returned, so credentials obtained by `InitMaster0` reach
//! the joins without any shared mutable state. The first failing action
//! stops the pass; cancellation is checked between actions and inside
//! every fan-out.

use std::sync::Arc;

use tracing::{info, instrument};

use keel_common::{Error, Result};
use keel_runtime::{ClusterRuntime, RuntimeContext};
use keel_ssh::CancellationToken;

use crate::collaborators::{
    GuestCommandRunner, ImagePuller, Phase, PluginHookRunner, RootfsMounter,
};
use crate::plan::{Action, Plan};

/// Executes plans against one cluster runtime.
pub struct ActionPipeline {
    runtime: Arc<dyn ClusterRuntime>,
    images: Arc<dyn ImagePuller>,
    rootfs: Arc<dyn RootfsMounter>,
    guest: Arc<dyn GuestCommandRunner>,
    plugins: Arc<dyn PluginHookRunner>,
    cancel: CancellationToken,
}

impl ActionPipeline {
    /// Pipeline over the given collaborators.
    pub fn new(
        runtime: Arc<dyn ClusterRuntime>,
        images: Arc<dyn ImagePuller>,
        rootfs: Arc<dyn RootfsMounter>,
        guest: Arc<dyn GuestCommandRunner>,
        plugins: Arc<dyn PluginHookRunner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            images,
            rootfs,
            guest,
            plugins,
            cancel,
        }
    }

    /// Run every action of `plan` in order, returning the final context.
    pub async fn execute(&self, plan: &Plan, mut ctx: RuntimeContext) -> Result<RuntimeContext> {
        info!(cluster = %ctx.cluster().name(), plan = %plan, "executing plan");
        for action in plan.actions() {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            ctx = self.run_action(action, ctx).await?;
        }
        Ok(ctx)
    }

    #[instrument(skip(self, ctx), fields(action = %action.name(), cluster = %ctx.cluster().name()))]
    async fn run_action(&self, action: &Action, ctx: RuntimeContext) -> Result<RuntimeContext> {
        info!("running action");
        match action {
            Action::PullImage => {
                self.images.pull_if_not_exist(&ctx.cluster().spec.image).await?;
                Ok(ctx)
            }
            Action::MountRootfs(hosts) => {
                if !hosts.is_empty() {
                    self.rootfs.mount(ctx.cluster(), hosts).await?;
                }
                Ok(ctx)
            }
            Action::InitMaster0 => {
                self.plugins.run(ctx.cluster(), Phase::PreInit).await?;
                self.runtime.init(ctx).await
            }
            Action::JoinMasters(ips) => self.runtime.join_masters(ctx, ips).await,
            Action::JoinNodes(ips) => self.runtime.join_nodes(ctx, ips).await,
            Action::ApplyMasters(changes) => {
                let mut ctx = ctx;
                if !changes.join.is_empty() {
                    ctx = self.runtime.join_masters(ctx, &changes.join).await?;
                }
                if !changes.delete.is_empty() {
                    ctx = self.runtime.delete_masters(ctx, &changes.delete).await?;
                }
                Ok(ctx)
            }
            Action::ApplyNodes(changes) => {
                let mut ctx = ctx;
                if !changes.join.is_empty() {
                    ctx = self.runtime.join_nodes(ctx, &changes.join).await?;
                }
                if !changes.delete.is_empty() {
                    ctx = self.runtime.delete_nodes(ctx, &changes.delete).await?;
                }
                Ok(ctx)
            }
            Action::Upgrade => self.runtime.upgrade(ctx).await,
            Action::RunGuestHooks => {
                self.plugins.run(ctx.cluster(), Phase::PreInstall).await?;
                self.guest.apply(ctx.cluster()).await?;
                self.plugins.run(ctx.cluster(), Phase::PostInstall).await?;
                Ok(ctx)
            }
            Action::Reset => {
                self.plugins.run(ctx.cluster(), Phase::PreClean).await?;
                let ctx = self.runtime.reset(ctx).await?;
                self.plugins.run(ctx.cluster(), Phase::PostClean).await?;
                Ok(ctx)
            }
            Action::UnmountRootfs => {
                self.rootfs.unmount(ctx.cluster()).await?;
                Ok(ctx)
            }
        }
    }
}
