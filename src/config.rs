//! Bootstrap configuration.
//!
//! The configuration is usually read from the host settings as a TOML table:
//!
//! ```toml
//! base_port = 8000
//! highest_port = 65535
//! connect_timeout_ms = 30000
//! launcher_capability = "myriac-console"
//! server_kind = "R"
//! ```
//!
//! Every field is optional and falls back to its default.

use std::time::Duration;

use serde::Deserialize;

use crate::{error::BootstrapError, launch::DEFAULT_LAUNCHER_CAPABILITY};

/// Default first port scanned by the port finder.
pub const DEFAULT_BASE_PORT: u16 = 8000;

/// Default time the server is given to dial back.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

fn default_highest_port() -> u16 {
    u16::MAX
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

fn default_launcher_capability() -> String {
    DEFAULT_LAUNCHER_CAPABILITY.to_owned()
}

fn default_server_kind() -> String {
    "R".to_owned()
}

/// Settings of a bootstrap attempt.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct BootstrapConfig {
    /// First port tried by the port finder.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Last port tried by the port finder, inclusive.
    #[serde(default = "default_highest_port")]
    pub highest_port: u16,
    /// Time given to the server to dial back, in milliseconds. Must not be zero.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Name under which the launcher capability is registered.
    #[serde(default = "default_launcher_capability")]
    pub launcher_capability: String,
    /// Kind of server requested from the launcher.
    #[serde(default = "default_server_kind")]
    pub server_kind: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            highest_port: default_highest_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            launcher_capability: default_launcher_capability(),
            server_kind: default_server_kind(),
        }
    }
}

impl BootstrapConfig {
    /// Parses and validates a TOML configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Config`] if the document is malformed or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self, BootstrapError> {
        let config: Self = toml::from_str(content)
            .map_err(|err| BootstrapError::Config(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values which cannot be expressed by the types alone.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<(), BootstrapError> {
        if self.base_port == 0 {
            return Err(BootstrapError::Config(
                "base_port must be greater than zero".to_owned(),
            ));
        }
        if self.base_port > self.highest_port {
            return Err(BootstrapError::Config(format!(
                "base_port {} is above highest_port {}",
                self.base_port, self.highest_port
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(BootstrapError::Config(
                "connect_timeout_ms must be greater than zero".to_owned(),
            ));
        }
        if self.launcher_capability.trim().is_empty() {
            return Err(BootstrapError::Config(
                "launcher_capability must not be empty".to_owned(),
            ));
        }
        if self.server_kind.trim().is_empty() {
            return Err(BootstrapError::Config(
                "server_kind must not be empty".to_owned(),
            ));
        }
        Ok(())
    }

    /// Returns the connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Sets the connect timeout, rounded up to the next millisecond.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout
            .as_micros()
            .div_ceil(1000)
            .try_into()
            .unwrap_or(u64::MAX);
        self
    }
}
