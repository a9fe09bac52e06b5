//! Persistent registry of groups and their members.
//!
//! [`Store`] is the blocking interface implemented by the backends. Request handlers use
//! [`GroupStore`], which runs every operation on the blocking pool and hands back a single
//! result.
//!
//! Cleanup runs after mutating operations, never before reads: a read may still observe a group
//! that has just become empty or expired.

use std::{fmt, path::Path, sync::Arc};

use atc_common::completion::{spawn_blocking, Closed};
use atc_shaping::{GroupId, Target};
use chrono::{DateTime, TimeDelta, Utc};

mod memory;
mod model;
mod sqlite;

pub use memory::MemoryStore;
pub use model::{Cleanup, Group, Member};
pub use sqlite::SqliteStore;

/// How long a group lives without updates, in hours.
pub const DEFAULT_GROUP_TIMEOUT_HOURS: i64 = 24;

/// Errors of the store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored profile could not be encoded or decoded.
    #[error("invalid shaping profile: {0}")]
    Profile(#[from] serde_json::Error),
    /// A row could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
    /// The referenced group does not exist.
    #[error("group {0} does not exist")]
    UnknownGroup(GroupId),
    /// The blocking task was cancelled or panicked.
    #[error("store task ended without a result")]
    Closed(#[from] Closed),
}

/// Result of a store operation.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Options shared by the store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// How long a group lives after its last update.
    pub group_timeout: TimeDelta,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { group_timeout: TimeDelta::hours(DEFAULT_GROUP_TIMEOUT_HOURS) }
    }
}

impl StoreOptions {
    /// Sets the group lifetime.
    pub const fn with_group_timeout(mut self, timeout: TimeDelta) -> Self {
        self.group_timeout = timeout;
        self
    }

    /// The timeout of a group written now.
    pub fn expiry(&self) -> DateTime<Utc> {
        Utc::now() + self.group_timeout
    }
}

/// Blocking storage backend.
///
/// Absence is reported as `Ok(None)`; `Err` is reserved for infrastructure failures.
pub trait Store: Send + Sync + 'static {
    /// The group `id`.
    fn group(&self, id: GroupId) -> Result<Option<Group>>;

    /// Every group, by id.
    fn groups(&self) -> Result<Vec<Group>>;

    /// Inserts or updates `group` and returns it as stored.
    ///
    /// A group with id 0 gets the next id. Ids are never reused. The timeout is refreshed and
    /// the secret of an existing group is kept.
    fn upsert_group(&self, group: &Group) -> Result<Group>;

    /// Inserts a new group together with its first member, atomically.
    fn insert_group_with_member(&self, group: &Group, target: &Target) -> Result<Group>;

    /// Deletes group `id` and its members. Missing groups are ignored.
    fn delete_group(&self, id: GroupId) -> Result<()>;

    /// The membership of `target`.
    fn member(&self, target: &Target) -> Result<Option<Member>>;

    /// Inserts or moves a member. The group must exist.
    fn upsert_member(&self, member: &Member) -> Result<()>;

    /// Deletes the membership of `target`, if any.
    fn delete_member(&self, target: &Target) -> Result<()>;

    /// Members of group `id`, in joining order.
    fn members_of(&self, id: GroupId) -> Result<Vec<Target>>;

    /// Every membership.
    fn members(&self) -> Result<Vec<Member>>;

    /// Deletes groups without members and expired groups, with their members.
    fn cleanup(&self) -> Result<Cleanup>;
}

/// Asynchronous handle on a [`Store`], cheap to clone.
#[derive(Clone)]
pub struct GroupStore {
    inner: Arc<dyn Store>,
}

impl fmt::Debug for GroupStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupStore").finish_non_exhaustive()
    }
}

impl GroupStore {
    /// Wraps a backend.
    pub fn new(store: impl Store) -> Self {
        Self { inner: Arc::new(store) }
    }

    /// Opens (or creates) the SQLite database at `path`.
    pub fn sqlite(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        SqliteStore::open(path, options).map(Self::new)
    }

    /// A store that lives only as long as the process.
    pub fn memory(options: StoreOptions) -> Self {
        Self::new(MemoryStore::new(options))
    }

    /// Runs `f` on the blocking pool. Failures are logged here, where they are detected.
    async fn call<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&dyn Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.inner);
        let res = spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(StoreError::from)
            .and_then(|res| res);

        if let Err(ref e) = res {
            tracing::error!(op, error = %e, "store operation failed");
        }

        res
    }

    /// See [`Store::group`].
    pub async fn group(&self, id: GroupId) -> Result<Option<Group>> {
        self.call("get group", move |store| store.group(id)).await
    }

    /// See [`Store::groups`].
    pub async fn groups(&self) -> Result<Vec<Group>> {
        self.call("get all groups", |store| store.groups()).await
    }

    /// See [`Store::upsert_group`].
    pub async fn upsert_group(&self, group: Group) -> Result<Group> {
        self.call("upsert group", move |store| store.upsert_group(&group)).await
    }

    /// See [`Store::insert_group_with_member`].
    pub async fn insert_group_with_member(&self, group: Group, target: Target) -> Result<Group> {
        self.call("insert group", move |store| store.insert_group_with_member(&group, &target))
            .await
    }

    /// See [`Store::delete_group`].
    pub async fn delete_group(&self, id: GroupId) -> Result<()> {
        self.call("delete group", move |store| store.delete_group(id)).await
    }

    /// See [`Store::member`].
    pub async fn member(&self, target: Target) -> Result<Option<Member>> {
        self.call("get member", move |store| store.member(&target)).await
    }

    /// See [`Store::upsert_member`].
    pub async fn upsert_member(&self, member: Member) -> Result<()> {
        self.call("upsert member", move |store| store.upsert_member(&member)).await
    }

    /// See [`Store::delete_member`].
    pub async fn delete_member(&self, target: Target) -> Result<()> {
        self.call("delete member", move |store| store.delete_member(&target)).await
    }

    /// See [`Store::members_of`].
    pub async fn members_of(&self, id: GroupId) -> Result<Vec<Target>> {
        self.call("get members of group", move |store| store.members_of(id)).await
    }

    /// See [`Store::members`].
    pub async fn members(&self) -> Result<Vec<Member>> {
        self.call("get all members", |store| store.members()).await
    }

    /// See [`Store::cleanup`].
    pub async fn cleanup(&self) -> Result<Cleanup> {
        self.call("cleanup", |store| store.cleanup()).await
    }

    /// Runs a cleanup pass in the background.
    pub fn cleanup_detached(&self) {
        let store = self.clone();
        tokio::spawn(async move {
            if let Ok(removed) = store.cleanup().await {
                if removed.total() > 0 {
                    tracing::info!(
                        empty = removed.empty,
                        expired = removed.expired,
                        "cleaned up groups"
                    );
                }
            }
        });
    }
}
