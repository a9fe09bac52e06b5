//! Network conditions as a service: clients join shaping groups, and the host they route
//! through emulates a link profile on their traffic.
//!
//! This crate re-exports the daemon ([`atcd`]) and the shaping backends ([`shaping`]).
#![doc(issue_tracker_base_url = "https://github.com/chainbound/atc-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use atc_common as common;
pub use atc_shaping as shaping;
pub use atcd::*;
