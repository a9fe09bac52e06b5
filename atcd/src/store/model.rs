use atc_shaping::{GroupId, Shaping, Target};
use chrono::{DateTime, Utc};

/// A persisted shaping group.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    /// Zero until the group is first persisted, then assigned by the store.
    pub id: GroupId,
    /// Never changes after creation; stores ignore updates to it.
    pub secret: String,
    /// The applied profile.
    pub shaping: Option<Shaping>,
    /// The group is removed by cleanup once this passes. Refreshed on every update.
    pub timeout: DateTime<Utc>,
}

impl Group {
    /// A group that has not been persisted yet.
    pub fn new(secret: impl Into<String>) -> Self {
        Self { id: 0, secret: secret.into(), shaping: None, timeout: Utc::now() }
    }

    /// Whether the store has assigned an id.
    pub const fn is_persisted(&self) -> bool {
        self.id > 0
    }

    /// Whether the timeout passed before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.timeout < now
    }
}

/// Membership of a target in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Member {
    /// The member.
    pub target: Target,
    /// The group it belongs to.
    pub group: GroupId,
}

impl Member {
    /// Membership of `target` in `group`.
    pub const fn new(target: Target, group: GroupId) -> Self {
        Self { target, group }
    }
}

/// Rows removed by a cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cleanup {
    /// Groups removed because no member referenced them.
    pub empty: usize,
    /// Groups removed because their timeout passed.
    pub expired: usize,
}

impl Cleanup {
    /// Groups removed in total.
    pub const fn total(&self) -> usize {
        self.empty + self.expired
    }
}
