use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{shaping::Shaping, target::Target, Result};

/// Identifier of a shaping group. Doubles as firewall mark and tc class minor.
pub type GroupId = i64;

/// The backend family reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Platform {
    /// [`LinuxShaper`](crate::LinuxShaper): `iptables` marks and `tc` classes.
    Linux,
    /// [`FakeShaper`](crate::FakeShaper): no kernel state is touched.
    Fake,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => f.write_str("LINUX"),
            Self::Fake => f.write_str("FAKE"),
        }
    }
}

/// Translates group membership and profiles into kernel state.
///
/// Implementations issue their changes in order and never roll back: if a call fails midway,
/// the steps that already succeeded stay applied.
#[async_trait]
pub trait Shaper: Send + Sync + 'static {
    /// The backend family, reported to clients.
    fn platform(&self) -> Platform;

    /// Discards stale marking rules and queueing disciplines.
    async fn initialize(&self) -> Result<()>;

    /// Marks the traffic of the first member of a new group.
    async fn create_group(&self, id: GroupId, target: &Target) -> Result<()>;

    /// Marks the traffic of `target` as belonging to group `id`.
    async fn join_group(&self, id: GroupId, target: &Target) -> Result<()>;

    /// Exact inverse of [`Shaper::join_group`].
    async fn leave_group(&self, id: GroupId, target: &Target) -> Result<()>;

    /// Replaces the profile of group `id`.
    async fn shape(&self, id: GroupId, shaping: &Shaping) -> Result<()>;

    /// Removes the profile of group `id`. Succeeds if there is none.
    async fn unshape(&self, id: GroupId) -> Result<()>;
}

impl fmt::Debug for dyn Shaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shaper").field("platform", &self.platform()).finish_non_exhaustive()
    }
}
