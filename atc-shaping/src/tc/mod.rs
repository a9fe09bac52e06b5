//! # Traffic Control Requests
//!
//! Builders for the `tc` command lines that enforce a group's shaping profile. Each group owns
//! one HTB class per interface, keyed by the group id, and every packet carrying the group's
//! firewall mark is steered into that class.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        HTB Root Qdisc (1:0)                                 │
//! │                                                                             │
//! │   Installed on both WAN and LAN at initialization. Unclassified traffic     │
//! │   is dequeued directly, unshaped.                                           │
//! └─────────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!            ┌───────────────────────┴───────────────────────┐
//!            │  fw filters, prio 1 (ip) and 2 (ipv6)         │
//!            │  handle = mark = group id                     │
//!            │  optional policer (drop or pass on excess)    │
//!            ▼                                               ▼
//! ┌──────────────────────────┐                   ┌──────────────────────────┐
//! │  Class 1:5 (group 5)     │                   │  Class 1:a (group 10)    │
//! │  rate = ceil = profile   │                   │  rate = ceil = profile   │
//! └──────────────────────────┘                   └──────────────────────────┘
//!              │                                              │
//!              ▼                                              ▼
//! ┌──────────────────────────┐                   ┌──────────────────────────┐
//! │  Netem (auto handle)     │                   │  Netem (auto handle)     │
//! │  delay, loss, reorder,   │                   │  different profile       │
//! │  corruption              │                   │                          │
//! └──────────────────────────┘                   └──────────────────────────┘
//! ```
//!
//! ## Handle Numbering Scheme
//!
//! | Component   | Handle       | Example (id=10) |
//! |-------------|--------------|-----------------|
//! | HTB root    | `1:0`        | `N/A`           |
//! | Group class | `1:id`       | `1:a`           |
//! | fw filter   | `id`         | `0xa`           |
//!
//! `tc` parses handles as hexadecimal, so group ids are always rendered in hex. The minor number
//! is 16 bits wide, which bounds usable group ids to `1..=0xffff`.
//!
//! The leaf netem qdisc is created without an explicit handle; deleting its class removes it.

pub mod core;
pub mod filter;
pub mod handle;
pub mod htb;
pub mod netem;
