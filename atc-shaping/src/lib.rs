#![doc(issue_tracker_base_url = "https://github.com/chainbound/atc-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Kernel side of atc: marks the packets of group members with `iptables` and shapes each
//! group's marked traffic with a `tc` HTB class, fw filters and a netem leaf.

pub mod command;
pub mod iptables;
pub mod target;
pub mod tc;

mod fake;
mod linux;
mod shaper;
mod shaping;

pub use fake::{FakeShaper, ShaperCall};
pub use linux::{LinuxShaper, LinuxShaperOptions};
pub use shaper::{GroupId, Platform, Shaper};
pub use shaping::{Corruption, Delay, LinkShaping, Loss, Reorder, Shaping};
pub use target::{ParseTargetError, Subnet, Target};
pub use tc::filter::PolicerAction;

/// Errors of the shaping backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A firewall or tc command failed.
    #[error("{op} on {on} failed: {source}")]
    Command {
        /// What was being done, e.g. `create class`.
        op: &'static str,
        /// The interface or firewall chain the command targeted.
        on: String,
        /// The underlying command failure.
        #[source]
        source: command::Error,
    },
    /// The id does not fit a non-zero 16-bit class minor.
    #[error("group id {0} cannot be used as a traffic class or firewall mark")]
    InvalidGroupId(GroupId),
    /// A firewall listing could not be read back.
    #[error("failed to parse firewall rule: {0}")]
    Rule(#[from] iptables::ParseRuleError),
}

/// Result of a backend operation.
pub type Result<T> = std::result::Result<T, Error>;
