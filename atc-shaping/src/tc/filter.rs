//! fw filters steering marked packets into a group's class.

use serde::{Deserialize, Serialize};

use super::handle::{Handle, TcRequestInner};

/// Link-layer protocols a group's traffic is classified for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// IPv4, protocol `ip`.
    Ip,
    /// IPv6, protocol `ipv6`.
    Ipv6,
}

impl Protocol {
    /// Every protocol, in filter priority order.
    pub const ALL: [Self; 2] = [Self::Ip, Self::Ipv6];

    /// The name `tc` uses.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Ipv6 => "ipv6",
        }
    }

    /// Filter priority; each protocol gets its own so both can share a handle.
    pub const fn prio(self) -> u16 {
        match self {
            Self::Ip => 1,
            Self::Ipv6 => 2,
        }
    }
}

/// What the policer does with traffic exceeding the group's rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicerAction {
    /// Excess packets are dropped at classification.
    #[default]
    Drop,
    /// Excess packets are classified anyway and left to the class queue.
    Pass,
}

impl PolicerAction {
    /// The name `tc` uses.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Pass => "pass",
        }
    }
}

/// A policer attached to a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Police {
    /// Rate above which the action applies, in kbit/s.
    pub rate_kbit: u64,
    /// Bucket size in bytes.
    pub burst_bytes: u64,
    /// Largest packet the bucket accepts, in bytes.
    pub mtu: u64,
    /// What to do with exceeding packets.
    pub action: PolicerAction,
}

/// A `fw` classifier matching the firewall mark `mark`.
#[derive(Debug, Clone)]
pub struct FwFilterRequest {
    /// Device and parent.
    pub inner: TcRequestInner,
    /// Protocol the filter classifies.
    pub protocol: Protocol,
    /// Firewall mark to match, also the filter handle.
    pub mark: u32,
    /// Class receiving matched packets.
    pub class_id: Option<Handle>,
    /// Policer applied before classification.
    pub police: Option<Police>,
}

impl FwFilterRequest {
    /// A filter attached to the root qdisc.
    pub fn new(device: impl Into<String>, protocol: Protocol, mark: u32) -> Self {
        Self {
            inner: TcRequestInner::new(device).with_parent(Handle::ROOT),
            protocol,
            mark,
            class_id: None,
            police: None,
        }
    }

    /// Sends matched packets to `class_id`.
    pub const fn with_class_id(mut self, class_id: Handle) -> Self {
        self.class_id = Some(class_id);
        self
    }

    /// Polices matched packets.
    pub const fn with_police(mut self, police: Police) -> Self {
        self.police = Some(police);
        self
    }

    fn selector(&self, verb: &str) -> Vec<String> {
        let mut args = self.inner.args("filter", verb);
        args.extend([
            "protocol".to_owned(),
            self.protocol.as_str().to_owned(),
            "prio".to_owned(),
            self.protocol.prio().to_string(),
            "handle".to_owned(),
            format!("{:#x}", self.mark),
            "fw".to_owned(),
        ]);
        args
    }

    /// `filter add dev <dev> parent 1: protocol <p> prio <n> handle <mark> fw ...`
    pub fn build(&self) -> Vec<String> {
        let mut args = self.selector("add");

        if let Some(class_id) = self.class_id {
            args.extend(["classid".to_owned(), class_id.to_string()]);
        }

        if let Some(police) = self.police {
            args.extend([
                "police".to_owned(),
                "rate".to_owned(),
                format!("{}kbit", police.rate_kbit),
                "burst".to_owned(),
                police.burst_bytes.to_string(),
                "mtu".to_owned(),
                police.mtu.to_string(),
                police.action.as_str().to_owned(),
            ]);
        }

        args
    }

    /// Deleting only needs the selector, not the class or policer.
    pub fn delete(&self) -> Vec<String> {
        self.selector("del")
    }
}
