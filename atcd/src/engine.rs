//! Orchestration of group lifecycle across the store, the shaping backend and hooks.
//!
//! Every mutation persists first, then changes kernel state, then fires hooks, so hook scripts
//! can already look the group up. Nothing is rolled back: if a later step fails, the earlier
//! ones stay applied and the error is returned.

use std::sync::Arc;

use atc_shaping::{GroupId, Platform, Shaper, Shaping, Target};
use tokio::task::JoinHandle;

use crate::{
    auth,
    config::{Config, ConfigError, EngineOptions},
    hooks::{HookRunner, HookTrigger},
    store::{Group, GroupStore, Member, StoreError},
    Error, Result,
};

/// Drives group lifecycle. Owns the periodic hook task, which stops when the engine is dropped.
#[derive(Debug)]
pub struct ShapingEngine {
    store: GroupStore,
    shaper: Arc<dyn Shaper>,
    hooks: Arc<HookRunner>,
    periodic: Option<JoinHandle<()>>,
}

impl ShapingEngine {
    /// Builds the engine and starts the periodic hooks, if any.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(
        store: GroupStore,
        shaper: Arc<dyn Shaper>,
        config: &Config,
        options: EngineOptions,
    ) -> std::result::Result<Self, ConfigError> {
        let hooks = HookRunner::new(config.build_hooks()?).with_daemon_addr(options.daemon_addr);
        let hooks = Arc::new(hooks);
        let periodic = hooks.spawn_periodic(options.periodic_resolution);

        Ok(Self { store, shaper, hooks, periodic })
    }

    /// The group store.
    pub const fn store(&self) -> &GroupStore {
        &self.store
    }

    /// The platform of the backend.
    pub fn platform(&self) -> Platform {
        self.shaper.platform()
    }

    /// Resets kernel state. Call once before reconciling.
    pub async fn initialize(&self) -> Result<()> {
        Ok(self.shaper.initialize().await?)
    }

    /// Creates a group whose first member is `target`.
    pub async fn create_group(&self, target: Target) -> Result<Group> {
        let previous = self.store.member(target).await?;
        let group = Group::new(auth::generate_secret());
        let group = self.store.insert_group_with_member(group, target).await?;

        self.release(previous, &target).await?;
        self.shaper.create_group(group.id, &target).await?;
        tracing::info!(id = group.id, %target, "group created");

        self.hooks.fire(HookTrigger::Join, group.id, &target).await?;
        Ok(group)
    }

    /// Adds `target` to group `id`, moving it out of any other group.
    pub async fn join_group(&self, id: GroupId, target: Target) -> Result<()> {
        let previous = self.store.member(target).await?;
        if previous.is_some_and(|member| member.group == id) {
            return Ok(());
        }

        self.store.upsert_member(Member::new(target, id)).await?;

        self.release(previous, &target).await?;
        self.shaper.join_group(id, &target).await?;
        tracing::info!(id, %target, "member joined");

        self.hooks.fire(HookTrigger::Join, id, &target).await?;
        Ok(())
    }

    /// Removes `target` from group `id`. Empty groups are cleaned up afterwards.
    pub async fn leave_group(&self, id: GroupId, target: Target) -> Result<()> {
        match self.store.member(target).await? {
            None => return Err(Error::NotFound),
            Some(member) if member.group != id => {
                return Err(Error::NotMember { target, group: id })
            }
            Some(_) => {}
        }

        self.store.delete_member(target).await?;

        self.shaper.leave_group(id, &target).await?;
        tracing::info!(id, %target, "member left");

        let res = self.hooks.fire(HookTrigger::Leave, id, &target).await;
        self.store.cleanup_detached();
        Ok(res?)
    }

    /// Applies `shaping` to `group` and persists it. Returns the settings as stored.
    pub async fn shape(&self, mut group: Group, shaping: Shaping) -> Result<Shaping> {
        self.shaper.shape(group.id, &shaping).await?;

        group.shaping = Some(shaping);
        let stored = self.store.upsert_group(group).await?;
        tracing::info!(id = stored.id, "group shaped");

        stored.shaping.ok_or_else(|| {
            StoreError::Corrupt(format!("profile of group {} was not stored", stored.id)).into()
        })
    }

    /// Removes the profile of `group`.
    pub async fn unshape(&self, mut group: Group) -> Result<()> {
        self.shaper.unshape(group.id).await?;

        group.shaping = None;
        let stored = self.store.upsert_group(group).await?;
        tracing::info!(id = stored.id, "group unshaped");

        Ok(())
    }

    /// Replays a persisted group into the kernel without touching the store or firing hooks.
    pub(crate) async fn restore(&self, group: &Group, members: &[Target]) -> Result<()> {
        let Some((first, rest)) = members.split_first() else {
            return Ok(());
        };

        self.shaper.create_group(group.id, first).await?;
        for target in rest {
            self.shaper.join_group(group.id, target).await?;
        }

        if let Some(shaping) = &group.shaping {
            self.shaper.shape(group.id, shaping).await?;
        }

        Ok(())
    }

    /// Drops the marking rules of a membership that was just replaced.
    async fn release(&self, previous: Option<Member>, target: &Target) -> Result<()> {
        if let Some(previous) = previous {
            self.shaper.leave_group(previous.group, target).await?;
            tracing::info!(id = previous.group, %target, "member moved out of group");
            self.store.cleanup_detached();
        }
        Ok(())
    }
}

impl Drop for ShapingEngine {
    fn drop(&mut self) {
        if let Some(periodic) = self.periodic.take() {
            periodic.abort();
        }
    }
}
