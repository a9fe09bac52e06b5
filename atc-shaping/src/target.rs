//! Shaping targets: single addresses and CIDR networks.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

/// Extension methods for prefix arithmetic on [`IpAddr`].
pub trait IpAddrExt {
    /// Returns the bits of the IP address, padding with zeros in case of an IPv4 address.
    fn to_bits(&self) -> u128;
    /// The prefix length that selects exactly this address (32 or 128).
    fn max_prefix(&self) -> u8;
    /// Clears every bit after the first `prefix` bits.
    fn masked(&self, prefix: u8) -> IpAddr;
}

impl IpAddrExt for IpAddr {
    fn to_bits(&self) -> u128 {
        match self {
            Self::V4(v4) => v4.to_bits().into(),
            Self::V6(v6) => v6.to_bits(),
        }
    }

    fn max_prefix(&self) -> u8 {
        match self {
            Self::V4(_) => 32,
            Self::V6(_) => 128,
        }
    }

    fn masked(&self, prefix: u8) -> IpAddr {
        match self {
            Self::V4(v4) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(prefix.min(32))).unwrap_or(0);
                Ipv4Addr::from_bits(v4.to_bits() & mask).into()
            }
            Self::V6(v6) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(prefix.min(128))).unwrap_or(0);
                Ipv6Addr::from_bits(v6.to_bits() & mask).into()
            }
        }
    }
}

/// A subnet, composed of a base IP address and a netmask.
///
/// The network address never has host bits set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subnet {
    /// The first address of the subnet.
    pub network_address: IpAddr,
    /// Prefix length in bits.
    pub netmask: u8,
}

impl Subnet {
    /// Creates the subnet of `address` with the given prefix length, clearing host bits.
    pub fn new(address: IpAddr, mask: u8) -> Self {
        let netmask = mask.min(address.max_prefix());
        Self { network_address: address.masked(netmask), netmask }
    }

    /// Whether `addr` falls inside this subnet. Addresses of the other family never do.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.network_address.is_ipv6() == addr.is_ipv6()
            && addr.masked(self.netmask) == self.network_address
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_address, self.netmask)
    }
}

/// Error returned when a string is neither an IP address nor a CIDR network.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseTargetError {
    /// The address part is not an IP address.
    #[error("invalid ip address: {0:?}")]
    Addr(String),
    /// The prefix length is not a number.
    #[error("invalid prefix length: {0:?}")]
    Prefix(String),
}

/// The unit of group membership: a single host or a whole network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    /// A single host.
    Addr(IpAddr),
    /// A network in CIDR notation.
    Net(Subnet),
}

impl Target {
    /// Whether the target is routed through the IPv6 firewall.
    pub const fn is_ipv6(&self) -> bool {
        match self {
            Self::Addr(addr) => addr.is_ipv6(),
            Self::Net(net) => net.network_address.is_ipv6(),
        }
    }

    /// Number of significant bits. Single addresses use the full length of their family.
    pub fn prefix_len(&self) -> u8 {
        match self {
            Self::Addr(addr) => addr.max_prefix(),
            Self::Net(net) => net.netmask,
        }
    }

    /// Whether traffic from `addr` belongs to this target.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match self {
            Self::Addr(own) => own == addr,
            Self::Net(net) => net.contains(addr),
        }
    }
}

impl From<IpAddr> for Target {
    fn from(addr: IpAddr) -> Self {
        Self::Addr(addr.to_canonical())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Addr(addr) => addr.fmt(f),
            Self::Net(net) => net.fmt(f),
        }
    }
}

impl FromStr for Target {
    type Err = ParseTargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let raw: IpAddr = addr.parse().map_err(|_| ParseTargetError::Addr(addr.to_owned()))?;
        // IPv4-mapped IPv6 addresses are treated as the IPv4 address they carry.
        let canonical = raw.to_canonical();

        let Some(prefix) = prefix else {
            return Ok(Self::Addr(canonical));
        };

        let invalid = || ParseTargetError::Prefix(prefix.to_owned());
        let mut len: u8 = prefix.parse().map_err(|_| invalid())?;
        if len > raw.max_prefix() {
            return Err(invalid());
        }
        if raw.is_ipv6() && canonical.is_ipv4() {
            len = len.checked_sub(96).ok_or_else(invalid)?;
        }

        if len == canonical.max_prefix() {
            Ok(Self::Addr(canonical))
        } else {
            Ok(Self::Net(Subnet::new(canonical, len)))
        }
    }
}
