//! Client and publisher configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`livewire.toml`)
//! - Environment variables (`LIVEWIRE_SERVICE_KEY`)

use crate::presence::PresenceOptions;
use crate::publish::PublisherConfig;
use crate::rpc::RpcOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable holding the service key.
pub const SERVICE_KEY_ENV: &str = "LIVEWIRE_SERVICE_KEY";

/// Livewire configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveConfig {
    /// RPC engine settings.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Presence settings.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Server-side publish settings.
    #[serde(default)]
    pub publish: PublishConfig,
}

/// RPC engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Default call timeout in milliseconds.
    #[serde(default = "default_rpc_timeout")]
    pub default_timeout_ms: u64,

    /// Maximum number of outstanding calls per engine.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

/// Presence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Delay before announcing the initial state, in milliseconds.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
}

/// Server-side publish settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Service key used to authenticate as a trusted principal.
    #[serde(default = "default_service_key", skip_serializing)]
    pub service_key: Option<String>,

    /// How long to wait for the channel to be joined, in milliseconds.
    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout_ms: u64,
}

// Default value functions
fn default_rpc_timeout() -> u64 {
    5_000
}

fn default_max_pending() -> usize {
    200
}

fn default_settle_delay() -> u64 {
    100
}

fn default_service_key() -> Option<String> {
    std::env::var(SERVICE_KEY_ENV)
        .ok()
        .filter(|key| !key.is_empty())
}

fn default_subscribe_timeout() -> u64 {
    5_000
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_rpc_timeout(),
            max_pending: default_max_pending(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            service_key: default_service_key(),
            subscribe_timeout_ms: default_subscribe_timeout(),
        }
    }
}

impl LiveConfig {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "livewire.toml",
            "/etc/livewire/livewire.toml",
            "~/.config/livewire/livewire.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid configuration.
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// RPC engine options.
    #[must_use]
    pub fn rpc_options(&self) -> RpcOptions {
        RpcOptions {
            default_timeout: Duration::from_millis(self.rpc.default_timeout_ms),
            max_pending: self.rpc.max_pending,
            ..RpcOptions::default()
        }
    }

    /// Presence options; key and state are left to the caller.
    #[must_use]
    pub fn presence_options(&self) -> PresenceOptions {
        PresenceOptions::default()
            .settle_delay(Duration::from_millis(self.presence.settle_delay_ms))
    }

    /// Publisher configuration.
    #[must_use]
    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            service_key: self.publish.service_key.clone(),
            subscribe_timeout: Duration::from_millis(self.publish.subscribe_timeout_ms),
        }
    }
}
