//! Shared helpers for the atc crates.

use std::time::SystemTime;

pub mod completion;

/// Returns the current UNIX timestamp in seconds.
#[inline]
pub fn unix_secs() -> u64 {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Unit constants used when translating shaping settings into kernel parameters.
pub mod constants {
    /// Bits in a kilobit, as understood by `tc` (`kbit` is decimal).
    pub const KBIT: u64 = 1_000;
    /// Bits in a byte.
    pub const BITS_PER_BYTE: u64 = 8;
}
