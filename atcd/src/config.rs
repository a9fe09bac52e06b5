//! Daemon configuration.
//!
//! The configuration document only lists hooks. Everything else is set programmatically by the
//! entrypoint through the option structs below.

use std::{io, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::hooks::{Hook, HookConfig};

/// Default validity window of a group token, in seconds.
pub const DEFAULT_OTP_TIMEOUT: u8 = 60;

/// Default interval between periodic hook runs.
pub const DEFAULT_PERIODIC_RESOLUTION: Duration = Duration::from_secs(5);

/// Errors loading or validating the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The file is not valid TOML.
    #[error("invalid toml: {0}")]
    Toml(#[from] toml::de::Error),
    /// The document is not valid JSON.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// A hook cannot be awaited and detached at once.
    #[error("hook {0:?} cannot be both async and success_required")]
    AsyncAndRequired(String),
    /// A hook names a trigger that does not exist.
    #[error("hook {hook:?} has unknown trigger {trigger:?}")]
    UnknownTrigger {
        /// The hook naming the trigger.
        hook: String,
        /// The unrecognized trigger name.
        trigger: String,
    },
    /// A hook has no program to run.
    #[error("hook {0:?} has an empty command")]
    EmptyCommand(String),
}

/// The configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Event hooks, in execution order.
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
}

impl Config {
    /// Loads and validates the document at `path`. `.json` files are read as JSON, anything else
    /// as TOML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&contents)
        } else {
            Self::from_toml_str(&contents)
        }
    }

    /// Like [`Config::from_path`], but a missing file is an empty configuration.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match Self::from_path(path.as_ref()) {
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                let path = path.as_ref().display();
                tracing::info!(%path, "no configuration file, using defaults");
                Ok(Self::default())
            }
            res => res,
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every hook definition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.build_hooks().map(drop)
    }

    pub(crate) fn build_hooks(&self) -> Result<Vec<Hook>, ConfigError> {
        self.hooks.iter().map(Hook::from_config).collect()
    }
}

/// Options of the [`Atcd`](crate::Atcd) facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtcdOptions {
    /// When false, every token is accepted and issued tokens are empty.
    pub secure: bool,
    /// Token validity window in seconds.
    pub otp_timeout: u8,
}

impl Default for AtcdOptions {
    fn default() -> Self {
        Self { secure: true, otp_timeout: DEFAULT_OTP_TIMEOUT }
    }
}

impl AtcdOptions {
    /// Enables or disables token checks.
    pub const fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Sets the token window. Values above 255 are capped, zero selects the default.
    pub fn with_otp_timeout(mut self, seconds: u32) -> Self {
        self.otp_timeout = match u8::try_from(seconds) {
            Ok(0) => DEFAULT_OTP_TIMEOUT,
            Ok(seconds) => seconds,
            Err(_) => {
                tracing::warn!(seconds, max = u8::MAX, "otp timeout too large, capping");
                u8::MAX
            }
        };
        self
    }
}

/// Options of the [`ShapingEngine`](crate::ShapingEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Interval between periodic hook runs, at least one second.
    pub periodic_resolution: Duration,
    /// Address the daemon serves on, exported to hooks as `ATCD_ADDR`.
    pub daemon_addr: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { periodic_resolution: DEFAULT_PERIODIC_RESOLUTION, daemon_addr: None }
    }
}

impl EngineOptions {
    /// Sets the periodic hook interval. Values below one second are raised to one second.
    pub fn with_periodic_resolution(mut self, resolution: Duration) -> Self {
        if resolution < Duration::from_secs(1) {
            tracing::warn!(?resolution, "periodic resolution below one second, using one second");
        }
        self.periodic_resolution = resolution.max(Duration::from_secs(1));
        self
    }

    /// Sets the address exported to hooks.
    pub fn with_daemon_addr(mut self, addr: impl Into<String>) -> Self {
        self.daemon_addr = Some(addr.into());
        self
    }
}
