//! TC handle computation and common request infrastructure.
//!
//! TC handles are split into major:minor (16:16 bits). This module provides utilities for
//! computing handles according to our numbering scheme.

use std::fmt;

use crate::{shaper::GroupId, Error};

/// A `major:minor` tc handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    /// Identifies the qdisc.
    pub major: u16,
    /// Identifies a class within the qdisc, zero for the qdisc itself.
    pub minor: u16,
}

impl Handle {
    /// The HTB root qdisc, `1:0`.
    pub const ROOT: Self = Self::new(1, 0);

    /// The handle `major:minor`.
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor == 0 {
            write!(f, "{:x}:", self.major)
        } else {
            write!(f, "{:x}:{:x}", self.major, self.minor)
        }
    }
}

/// Compute the HTB class handle for a group.
///
/// # Handle Format
///
/// Returns `1:id`. Fails for ids that do not fit a non-zero 16-bit minor.
///
/// # Example
///
/// ```
/// use atc_shaping::tc::handle::group_class;
/// assert_eq!(group_class(10).unwrap().to_string(), "1:a");
/// ```
pub fn group_class(id: GroupId) -> Result<Handle, Error> {
    match u16::try_from(id) {
        Ok(minor) if minor != 0 => Ok(Handle::new(Handle::ROOT.major, minor)),
        _ => Err(Error::InvalidGroupId(id)),
    }
}

/// The firewall mark carried by packets of a group. Validated like [`group_class`].
pub fn group_mark(id: GroupId) -> Result<u32, Error> {
    group_class(id).map(|class| u32::from(class.minor))
}

/// Common fields shared by all qdisc/class/filter requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcRequestInner {
    /// The network interface name.
    pub device: String,
    /// The parent handle, `None` for the root.
    pub parent: Option<Handle>,
}

impl TcRequestInner {
    /// Create a new request for the given interface, defaulting to root parent.
    pub fn new(device: impl Into<String>) -> Self {
        Self { device: device.into(), parent: None }
    }

    /// Set the parent handle.
    pub const fn with_parent(mut self, parent: Handle) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Starts a command line: `<object> <verb> dev <device> (root | parent <parent>)`.
    pub(crate) fn args(&self, object: &str, verb: &str) -> Vec<String> {
        let mut args =
            vec![object.to_owned(), verb.to_owned(), "dev".to_owned(), self.device.clone()];
        match self.parent {
            Some(parent) => args.extend(["parent".to_owned(), parent.to_string()]),
            None => args.push("root".to_owned()),
        }
        args
    }
}
