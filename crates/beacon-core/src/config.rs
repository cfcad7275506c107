//! SDK configuration loaded from defaults, an optional TOML file, and
//! environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable overriding the configured app key.
const ENV_APP_KEY: &str = "BEACON_APP_KEY";
/// Environment variable overriding the configured base URL.
const ENV_BASE_URL: &str = "BEACON_BASE_URL";

/// Live app keys carry this prefix.
const LIVE_KEY_PREFIX: &str = "key_live_";
/// Test app keys carry this prefix.
const TEST_KEY_PREFIX: &str = "key_test_";

/// Configuration for a Beacon client instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BeaconConfig {
    /// App key identifying this app to the attribution service.
    pub app_key: String,
    /// Base URL of the attribution service.
    pub base_url: String,
    /// Upper bound on total time an operation may sit queued-but-ineligible.
    pub request_timeout_ms: u64,
    /// Upper bound on a single transport call.
    pub task_timeout_ms: u64,
    /// Number of ineligibility checks before an operation is failed out.
    pub retry_limit: u32,
    /// Delay between polls of a blocked queue head.
    pub retry_delay_ms: u64,
    /// How long a wait-lock may stay set before recovery is attempted.
    pub stuck_lock_threshold_ms: u64,
    /// Maximum queued operations before eviction kicks in.
    pub max_queue_items: usize,
    /// Grace window between `Resetting` and `Uninitialized` during reset.
    pub reset_grace_ms: u64,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            base_url: "https://api.example-attribution.io/v1".to_string(),
            request_timeout_ms: 30_000,
            task_timeout_ms: 5_500,
            retry_limit: 5,
            retry_delay_ms: 100,
            stuck_lock_threshold_ms: 10_000,
            max_queue_items: 25,
            reset_grace_ms: 10,
        }
    }
}

impl BeaconConfig {
    /// Create a config with the given app key and defaults for the rest.
    pub fn with_key(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("read {}: {e}", path.display())))?;
        toml::from_str(&contents).map_err(|e| Error::config(format!("parse {}: {e}", path.display())))
    }

    /// Load configuration from an optional file plus environment overrides.
    ///
    /// `BEACON_APP_KEY` and `BEACON_BASE_URL` take precedence over file
    /// values when set.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        if let Ok(key) = std::env::var(ENV_APP_KEY) {
            config.app_key = key;
        }
        if let Ok(url) = std::env::var(ENV_BASE_URL) {
            config.base_url = url;
        }
        Ok(config)
    }

    /// Validate the app key format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] when the key is empty or does not carry
    /// a known prefix.
    pub fn validate_key(&self) -> Result<()> {
        if self.app_key.starts_with(LIVE_KEY_PREFIX) || self.app_key.starts_with(TEST_KEY_PREFIX) {
            Ok(())
        } else {
            Err(Error::invalid_key(self.app_key.clone()))
        }
    }

    /// `true` when configured with a test-mode key.
    pub fn is_test_key(&self) -> bool {
        self.app_key.starts_with(TEST_KEY_PREFIX)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn stuck_lock_threshold(&self) -> Duration {
        Duration::from_millis(self.stuck_lock_threshold_ms)
    }

    pub fn reset_grace(&self) -> Duration {
        Duration::from_millis(self.reset_grace_ms)
    }
}
