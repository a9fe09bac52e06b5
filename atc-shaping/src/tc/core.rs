//! Rate and buffer arithmetic shared by the tc builders.

use atc_common::constants::{BITS_PER_BYTE, KBIT};

/// Standard Ethernet MTU in bytes.
pub const MTU_ETHERNET: u64 = 1_500;

/// The largest rate a 32-bit kernel rate spec (bytes per second) can express, in kbit/s.
pub const MAX_RATE_KBIT: u64 = u32::MAX as u64 * BITS_PER_BYTE / KBIT;

/// Policer burst used when either the rate or the delay of a profile is zero.
pub const DEFAULT_BURST_BYTES: u64 = 10 * MTU_ETHERNET;

/// Largest packet the policer accepts, in bytes.
pub const POLICE_MTU: u64 = 2_048;

/// The class rate for a profile rate. Zero means unlimited, never zero throughput.
pub const fn effective_rate_kbit(rate_kbit: u64) -> u64 {
    if rate_kbit == 0 || rate_kbit > MAX_RATE_KBIT {
        MAX_RATE_KBIT
    } else {
        rate_kbit
    }
}

/// Policer bucket size: the bytes that flow at `rate_kbit` during `delay_ms`.
///
/// Never smaller than one Ethernet frame.
pub fn police_burst_bytes(rate_kbit: u64, delay_ms: u32) -> u64 {
    if rate_kbit == 0 || delay_ms == 0 {
        return DEFAULT_BURST_BYTES;
    }

    let bytes_per_sec = rate_kbit.saturating_mul(KBIT) / BITS_PER_BYTE;
    (bytes_per_sec.saturating_mul(u64::from(delay_ms)) / 1_000).max(MTU_ETHERNET)
}
