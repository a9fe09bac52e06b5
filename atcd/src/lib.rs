#![doc(issue_tracker_base_url = "https://github.com/chainbound/atc-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Core of the atc daemon.
//!
//! Clients group endpoints, addressed by IP or CIDR, and attach a shaping profile to each group.
//! [`Atcd`] is the entry point: it authenticates requests and hands them to the
//! [`ShapingEngine`], which keeps the [`GroupStore`], the kernel (through a
//! [`Shaper`](atc_shaping::Shaper)) and user hooks in step.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use atc_shaping::{LinuxShaper, LinuxShaperOptions};
//! use atcd::{reconcile, Atcd, AtcdOptions, Config, EngineOptions, GroupStore, ShapingEngine};
//! use atcd::StoreOptions;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = GroupStore::sqlite("/var/lib/atcd/atcd.db", StoreOptions::default())?;
//! let options = LinuxShaperOptions::default().with_wan("eth0").with_lan("eth1");
//! let shaper = Arc::new(LinuxShaper::new(options));
//! let config = Config::load_or_default("/etc/atcd/atcd.toml")?;
//!
//! let engine = Arc::new(ShapingEngine::new(store, shaper, &config, EngineOptions::default())?);
//! engine.initialize().await?;
//! reconcile(&engine).await?;
//!
//! let atcd = Atcd::new(engine, AtcdOptions::default());
//! let _group = atcd.create_group("10.0.0.5").await?;
//! # Ok(())
//! # }
//! ```

use atc_shaping::{GroupId, ParseTargetError, Target};

pub mod auth;
pub mod config;
pub mod hooks;
pub mod store;

mod engine;
mod reconcile;
mod service;

pub use config::{AtcdOptions, Config, ConfigError, EngineOptions};
pub use engine::ShapingEngine;
pub use hooks::{HookError, HookRunner, HookTrigger};
pub use reconcile::{reconcile, ReconcileError, Reconciled};
pub use service::{Atcd, ServerInfo, ShapingGroup};
pub use store::{GroupStore, StoreError, StoreOptions};

/// Errors returned by the daemon operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No such group, or no group shapes the member.
    #[error("not found")]
    NotFound,
    /// The member is not part of the group it was removed from.
    #[error("{target} is not a member of group {group}")]
    NotMember {
        /// The member asked for.
        target: Target,
        /// The group it was expected in.
        group: GroupId,
    },
    /// The token does not match the group.
    #[error("unauthorized")]
    Unauthorized,
    /// The member is not an address or network.
    #[error("invalid member: {0}")]
    InvalidTarget(#[from] ParseTargetError),
    /// Details are logged where the failure is detected.
    #[error("database error")]
    Store(#[from] StoreError),
    /// The shaping backend failed.
    #[error("shaping failed: {0}")]
    Backend(#[from] atc_shaping::Error),
    /// A required hook failed.
    #[error("hook failed: {0}")]
    Hook(#[from] HookError),
    /// The configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Result of a daemon operation.
pub type Result<T> = std::result::Result<T, Error>;
