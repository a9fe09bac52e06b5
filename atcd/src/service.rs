//! The capability surface served to clients.
//!
//! Every mutating call verifies the group token before anything is changed, so a rejected
//! request leaves both the store and the kernel untouched.

use std::sync::Arc;

use atc_shaping::{GroupId, Platform, Shaping, Target};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::{
    auth::Authenticator,
    config::AtcdOptions,
    engine::ShapingEngine,
    store::Group,
    Error, Result,
};

/// A group as shown to clients. Secrets never leave the daemon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShapingGroup {
    /// The group id.
    pub id: GroupId,
    /// Members in joining order.
    pub members: Vec<String>,
    /// The applied profile, if any.
    pub shaping: Option<Shaping>,
}

impl ShapingGroup {
    fn new(group: Group, members: &[Target]) -> Self {
        Self {
            id: group.id,
            members: members.iter().map(Target::to_string).collect(),
            shaping: group.shaping,
        }
    }
}

/// What the daemon runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    /// The shaping backend.
    pub platform: Platform,
    /// Version of the daemon.
    pub version: String,
}

/// The daemon facade: authentication in front of the [`ShapingEngine`].
#[derive(Debug)]
pub struct Atcd {
    engine: Arc<ShapingEngine>,
    auth: Authenticator,
}

impl Atcd {
    /// Wraps `engine`, checking tokens if `options.secure` is set.
    pub fn new(engine: Arc<ShapingEngine>, options: AtcdOptions) -> Self {
        if !options.secure {
            tracing::warn!("running in insecure mode, every token is accepted");
        }

        Self { engine, auth: Authenticator::new(&options) }
    }

    /// The engine behind the facade.
    pub fn engine(&self) -> &ShapingEngine {
        &self.engine
    }

    /// Platform and version.
    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            platform: self.engine.platform(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    /// Creates a group with `member` as its first member.
    pub async fn create_group(&self, member: &str) -> Result<ShapingGroup> {
        let target: Target = member.parse()?;
        let group = self.engine.create_group(target).await?;
        self.view(group).await
    }

    /// The group `id` with its members.
    pub async fn get_group(&self, id: GroupId) -> Result<ShapingGroup> {
        let group = self.record(id).await?;
        self.view(group).await
    }

    /// The group shaping `member`: the group it joined, or else the group of the most specific
    /// joined network containing it.
    pub async fn get_group_with(&self, member: &str) -> Result<ShapingGroup> {
        let target: Target = member.parse()?;
        let store = self.engine.store();

        let id = match store.member(target).await? {
            Some(member) => member.group,
            None => {
                let Target::Addr(addr) = target else {
                    return Err(Error::NotFound);
                };
                store
                    .members()
                    .await?
                    .into_iter()
                    .filter(|member| member.target.contains(&addr))
                    .max_by_key(|member| member.target.prefix_len())
                    .map(|member| member.group)
                    .ok_or(Error::NotFound)?
            }
        };

        self.get_group(id).await
    }

    /// Every group with its members.
    pub async fn list_groups(&self) -> Result<Vec<ShapingGroup>> {
        let store = self.engine.store();
        let (groups, members) = futures::future::try_join(store.groups(), store.members()).await?;

        let mut by_group: FxHashMap<GroupId, Vec<Target>> = FxHashMap::default();
        for member in members {
            by_group.entry(member.group).or_default().push(member.target);
        }

        Ok(groups
            .into_iter()
            .map(|group| {
                let members = by_group.remove(&group.id).unwrap_or_default();
                ShapingGroup::new(group, &members)
            })
            .collect())
    }

    /// The current token of group `id`. Empty in insecure mode.
    pub async fn group_token(&self, id: GroupId) -> Result<String> {
        let group = self.record(id).await?;
        Ok(self.auth.token(&group))
    }

    /// Adds `member` to group `id`, moving it out of any other group.
    pub async fn join_group(&self, id: GroupId, member: &str, token: &str) -> Result<()> {
        let target: Target = member.parse()?;
        self.authorize(id, token).await?;
        self.engine.join_group(id, target).await
    }

    /// Removes `member` from group `id`. An emptied group goes with the next cleanup.
    pub async fn leave_group(&self, id: GroupId, member: &str, token: &str) -> Result<()> {
        let target: Target = member.parse()?;
        self.authorize(id, token).await?;
        self.engine.leave_group(id, target).await
    }

    /// Replaces the profile of group `id` and returns it as applied.
    pub async fn shape_group(&self, id: GroupId, shaping: Shaping, token: &str) -> Result<Shaping> {
        let group = self.authorize(id, token).await?;
        self.engine.shape(group, shaping).await
    }

    /// Removes the profile of group `id`. Members stay joined.
    pub async fn unshape_group(&self, id: GroupId, token: &str) -> Result<()> {
        let group = self.authorize(id, token).await?;
        self.engine.unshape(group).await
    }

    async fn record(&self, id: GroupId) -> Result<Group> {
        self.engine.store().group(id).await?.ok_or(Error::NotFound)
    }

    async fn authorize(&self, id: GroupId, token: &str) -> Result<Group> {
        let group = self.record(id).await?;
        if !self.auth.verify(&group, token) {
            tracing::warn!(id, "rejected invalid token");
            return Err(Error::Unauthorized);
        }
        Ok(group)
    }

    async fn view(&self, group: Group) -> Result<ShapingGroup> {
        let members = self.engine.store().members_of(group.id).await?;
        Ok(ShapingGroup::new(group, &members))
    }
}
