//! HTB (Hierarchical Token Bucket) qdisc and class support.
//!
//! HTB is the root classifier on both interfaces. It correctly handles non-work-conserving
//! child qdiscs like netem: when netem holds a packet back, HTB moves on to the next class
//! instead of blocking the whole interface.

use super::{
    core::effective_rate_kbit,
    handle::{Handle, TcRequestInner},
};

/// The root HTB qdisc of an interface.
#[derive(Debug, Clone)]
pub struct QdiscHtbRequest {
    /// Device and parent.
    pub inner: TcRequestInner,
}

impl QdiscHtbRequest {
    /// The root qdisc of `inner.device`.
    pub const fn new(inner: TcRequestInner) -> Self {
        Self { inner }
    }

    /// `qdisc add dev <dev> root handle 1: htb`
    pub fn build(&self) -> Vec<String> {
        let mut args = self.inner.args("qdisc", "add");
        args.extend(["handle".to_owned(), Handle::ROOT.to_string(), "htb".to_owned()]);
        args
    }

    /// Removes whatever root qdisc the interface currently has.
    pub fn delete(&self) -> Vec<String> {
        self.inner.args("qdisc", "del")
    }
}

/// An HTB class holding one group's traffic.
#[derive(Debug, Clone)]
pub struct HtbClassRequest {
    /// Device and parent.
    pub inner: TcRequestInner,
    /// The class handle, `1:<id>`.
    pub class_id: Handle,
    /// Committed and peak rate in kbit/s, zero for the maximum.
    pub rate_kbit: u64,
}

impl HtbClassRequest {
    /// A class under the root qdisc, defaulting to the maximum rate.
    pub fn new(device: impl Into<String>, class_id: Handle) -> Self {
        Self {
            inner: TcRequestInner::new(device).with_parent(Handle::ROOT),
            class_id,
            rate_kbit: 0,
        }
    }

    /// Sets committed and peak rate. Zero selects the maximum rate.
    pub const fn with_rate(mut self, rate_kbit: u64) -> Self {
        self.rate_kbit = rate_kbit;
        self
    }

    /// `class add dev <dev> parent 1: classid 1:<id> htb rate <r>kbit ceil <r>kbit`
    pub fn build(&self) -> Vec<String> {
        let rate = format!("{}kbit", effective_rate_kbit(self.rate_kbit));

        let mut args = self.inner.args("class", "add");
        args.extend([
            "classid".to_owned(),
            self.class_id.to_string(),
            "htb".to_owned(),
            "rate".to_owned(),
            rate.clone(),
            "ceil".to_owned(),
            rate,
        ]);
        args
    }

    /// Removes the class together with its leaf qdisc.
    pub fn delete(&self) -> Vec<String> {
        let mut args = self.inner.args("class", "del");
        args.extend(["classid".to_owned(), self.class_id.to_string()]);
        args
    }
}
