use std::collections::BTreeMap;

use atc_shaping::{GroupId, Target};
use chrono::Utc;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{Cleanup, Group, Member, Result, Store, StoreError, StoreOptions};

#[derive(Debug, Clone, Copy)]
struct MemberEntry {
    group: GroupId,
    /// Position in joining order.
    seq: u64,
}

#[derive(Debug, Default)]
struct State {
    groups: BTreeMap<GroupId, Group>,
    members: FxHashMap<Target, MemberEntry>,
    /// Highest id ever assigned, so deleted ids are not handed out again.
    last_id: GroupId,
    next_seq: u64,
}

impl State {
    fn upsert_group(&mut self, group: &Group, options: &StoreOptions) -> Group {
        let id = if group.is_persisted() {
            self.last_id = self.last_id.max(group.id);
            group.id
        } else {
            self.last_id += 1;
            self.last_id
        };

        let secret =
            self.groups.get(&id).map_or_else(|| group.secret.clone(), |g| g.secret.clone());
        let stored =
            Group { id, secret, shaping: group.shaping.clone(), timeout: options.expiry() };
        self.groups.insert(id, stored.clone());
        stored
    }

    fn upsert_member(&mut self, member: &Member) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.members.insert(member.target, MemberEntry { group: member.group, seq });
    }

    fn delete_groups(&mut self, mut doomed: impl FnMut(&Group) -> bool) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, group| !doomed(group));
        let groups = &self.groups;
        self.members.retain(|_, entry| groups.contains_key(&entry.group));
        before - self.groups.len()
    }

    fn members_sorted(&self) -> Vec<Member> {
        let mut members: Vec<_> = self.members.iter().collect();
        members.sort_by_key(|(_, entry)| entry.seq);
        members.into_iter().map(|(target, entry)| Member::new(*target, entry.group)).collect()
    }
}

/// A [`Store`] that keeps everything in memory.
///
/// Readers share the lock; writers hold it exclusively for the whole operation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    options: StoreOptions,
}

impl MemoryStore {
    /// An empty store.
    pub fn new(options: StoreOptions) -> Self {
        Self { state: RwLock::default(), options }
    }
}

impl Store for MemoryStore {
    fn group(&self, id: GroupId) -> Result<Option<Group>> {
        Ok(self.state.read().groups.get(&id).cloned())
    }

    fn groups(&self) -> Result<Vec<Group>> {
        Ok(self.state.read().groups.values().cloned().collect())
    }

    fn upsert_group(&self, group: &Group) -> Result<Group> {
        Ok(self.state.write().upsert_group(group, &self.options))
    }

    fn insert_group_with_member(&self, group: &Group, target: &Target) -> Result<Group> {
        let mut state = self.state.write();
        let group = state.upsert_group(group, &self.options);
        state.upsert_member(&Member::new(*target, group.id));
        Ok(group)
    }

    fn delete_group(&self, id: GroupId) -> Result<()> {
        self.state.write().delete_groups(|group| group.id == id);
        Ok(())
    }

    fn member(&self, target: &Target) -> Result<Option<Member>> {
        let state = self.state.read();
        Ok(state.members.get(target).map(|entry| Member::new(*target, entry.group)))
    }

    fn upsert_member(&self, member: &Member) -> Result<()> {
        let mut state = self.state.write();
        if !state.groups.contains_key(&member.group) {
            return Err(StoreError::UnknownGroup(member.group));
        }

        state.upsert_member(member);
        Ok(())
    }

    fn delete_member(&self, target: &Target) -> Result<()> {
        self.state.write().members.remove(target);
        Ok(())
    }

    fn members_of(&self, id: GroupId) -> Result<Vec<Target>> {
        let state = self.state.read();
        Ok(state
            .members_sorted()
            .into_iter()
            .filter(|member| member.group == id)
            .map(|member| member.target)
            .collect())
    }

    fn members(&self) -> Result<Vec<Member>> {
        Ok(self.state.read().members_sorted())
    }

    fn cleanup(&self) -> Result<Cleanup> {
        let mut state = self.state.write();

        let referenced: Vec<GroupId> = state.members.values().map(|entry| entry.group).collect();
        let empty = state.delete_groups(|group| !referenced.contains(&group.id));

        let now = Utc::now();
        let expired = state.delete_groups(|group| group.is_expired(now));

        Ok(Cleanup { empty, expired })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::store::conformance;

    fn store() -> MemoryStore {
        MemoryStore::new(StoreOptions::default())
    }

    #[test]
    fn ids_are_increasing_and_never_reused() {
        conformance::ids_are_increasing_and_never_reused(&store());
    }

    #[test]
    fn upsert_keeps_secret_and_refreshes_timeout() {
        conformance::upsert_keeps_secret_and_refreshes_timeout(&store());
    }

    #[test]
    fn membership_is_exclusive() {
        conformance::membership_is_exclusive(&store());
    }

    #[test]
    fn cleanup_removes_empty_groups() {
        conformance::cleanup_removes_empty_groups(&store());
    }

    #[test]
    fn cleanup_removes_expired_groups() {
        let options = StoreOptions::default().with_group_timeout(TimeDelta::seconds(-10));
        conformance::cleanup_removes_expired_groups(&MemoryStore::new(options));
    }

    #[test]
    fn deleting_a_group_cascades() {
        conformance::deleting_a_group_cascades(&store());
    }

    #[test]
    fn explicit_ids_advance_the_counter() {
        let store = store();
        let mut group = Group::new("s");
        group.id = 40;
        store.upsert_group(&group).unwrap();

        assert_eq!(store.upsert_group(&Group::new("s")).unwrap().id, 41);
    }
}
