//! Startup replay of persisted state into the kernel.

use atc_shaping::{GroupId, Target};
use rustc_hash::FxHashMap;

use crate::{engine::ShapingEngine, store::StoreError, Error};

/// Failure to bring the kernel in line with the store.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The persisted groups could not be read.
    #[error("failed to load persisted groups: {0}")]
    Load(#[from] StoreError),
    /// A group could not be shaped again.
    #[error("failed to restore group {group}: {source}")]
    Restore {
        /// The group being restored.
        group: GroupId,
        /// What went wrong.
        #[source]
        source: Error,
    },
}

/// Outcome of a successful [`reconcile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciled {
    /// Groups shaped again.
    pub restored: usize,
    /// Groups without members, left for cleanup.
    pub skipped: usize,
}

/// Restores every persisted group with at least one member: the first member is replayed as
/// a group creation, the others as joins, then the profile is reapplied.
///
/// Stops at the first failure. The daemon should not serve after an error, since the kernel may
/// then disagree with the store.
pub async fn reconcile(engine: &ShapingEngine) -> Result<Reconciled, ReconcileError> {
    let store = engine.store();
    let groups = store.groups().await?;

    let mut by_group: FxHashMap<GroupId, Vec<Target>> = FxHashMap::default();
    for member in store.members().await? {
        by_group.entry(member.group).or_default().push(member.target);
    }

    let mut reconciled = Reconciled::default();
    for group in groups {
        let Some(members) = by_group.get(&group.id) else {
            tracing::debug!(id = group.id, "skipping empty group");
            reconciled.skipped += 1;
            continue;
        };

        engine
            .restore(&group, members)
            .await
            .map_err(|source| ReconcileError::Restore { group: group.id, source })?;

        tracing::info!(
            id = group.id,
            members = members.len(),
            shaped = group.shaping.is_some(),
            "group restored"
        );
        reconciled.restored += 1;
    }

    Ok(reconciled)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use atc_shaping::{FakeShaper, ShaperCall, Shaping};

    use super::*;
    use crate::{
        config::{Config, EngineOptions},
        store::{Group, GroupStore, Member, StoreOptions},
    };

    fn target(s: &str) -> Target {
        s.parse().unwrap()
    }

    async fn setup() -> (ShapingEngine, Arc<FakeShaper>, Group, Group) {
        let _ = tracing_subscriber::fmt::try_init();
        let store = GroupStore::memory(StoreOptions::default());

        let mut shaped =
            store.insert_group_with_member(Group::new("a"), target("1.2.3.4")).await.unwrap();
        store.upsert_member(Member::new(target("10.0.0.0/24"), shaped.id)).await.unwrap();
        shaped.shaping = Some(Shaping::default());
        let shaped = store.upsert_group(shaped).await.unwrap();
        let empty = store.upsert_group(Group::new("b")).await.unwrap();

        let shaper = Arc::new(FakeShaper::new());
        let engine =
            ShapingEngine::new(store, shaper.clone(), &Config::default(), EngineOptions::default())
                .unwrap();
        (engine, shaper, shaped, empty)
    }

    #[tokio::test]
    async fn replays_members_and_profiles() {
        let (engine, shaper, shaped, _) = setup().await;

        let reconciled = reconcile(&engine).await.unwrap();
        assert_eq!(reconciled, Reconciled { restored: 1, skipped: 1 });
        assert_eq!(
            shaper.calls(),
            vec![
                ShaperCall::CreateGroup(shaped.id, target("1.2.3.4")),
                ShaperCall::JoinGroup(shaped.id, target("10.0.0.0/24")),
                ShaperCall::Shape(shaped.id, Shaping::default()),
            ]
        );
    }

    #[tokio::test]
    async fn failure_names_the_group() {
        let (engine, shaper, shaped, _) = setup().await;
        shaper.fail_on("shape");

        let err = reconcile(&engine).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Restore { group, .. } if group == shaped.id));
        assert!(err.to_string().starts_with(&format!("failed to restore group {}", shaped.id)));
    }
}
