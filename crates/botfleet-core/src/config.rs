//! Worker settings
//!
//! Loads settings from config files and environment variables.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker settings loaded from files and environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Name of this worker; bots are partitioned by it
    #[serde(default = "default_worker_name")]
    pub worker_name: String,

    /// Aggregate transport send rate of the process
    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: u32,
    /// Seconds between scans for running jobs
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Seconds between health check passes
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Redis URL of the ephemeral progress store
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Expiry applied to the progress keys of terminal jobs
    #[serde(default = "default_progress_ttl_secs")]
    pub progress_ttl_secs: i64,
    /// Lifetime of a cached delivery media reference
    #[serde(default = "default_media_cache_ttl_secs")]
    pub media_cache_ttl_secs: i64,

    /// Secret used to derive the credential encryption key
    pub encryption_key: Option<String>,

    /// R2 Storage access key ID
    pub r2_access_key_id: Option<String>,
    /// R2 Storage secret access key
    pub r2_secret_access_key: Option<String>,
    /// R2 Storage endpoint URL
    pub r2_endpoint_url: Option<String>,
    /// R2 Storage bucket name
    pub r2_bucket_name: Option<String>,

    /// Maximum number of cached transport handles
    #[serde(default = "default_transport_cache_capacity")]
    pub transport_cache_capacity: u64,
}

fn default_worker_name() -> String {
    "worker-1".to_string()
}

const fn default_messages_per_second() -> u32 {
    15
}

const fn default_scan_interval_secs() -> u64 {
    10
}

const fn default_health_check_interval_secs() -> u64 {
    3600
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

const fn default_progress_ttl_secs() -> i64 {
    7 * 24 * 60 * 60
}

const fn default_media_cache_ttl_secs() -> i64 {
    30 * 24 * 60 * 60
}

const fn default_transport_cache_capacity() -> u64 {
    10_000
}

/// Build the layered configuration source.
///
/// # Errors
///
/// Returns a `ConfigError` if a present source cannot be read.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // Not checked into git
        .add_source(File::with_name("config/local").required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        // Empty env vars are treated as unset
        .add_source(Environment::default().ignore_empty(true))
        .build()
}

impl Settings {
    /// Load settings from config files and the environment
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use botfleet_core::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let settings: Self = build_config()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_name.trim().is_empty() {
            return Err(ConfigError::Message("worker_name must not be empty".into()));
        }
        if self.messages_per_second == 0 {
            return Err(ConfigError::Message(
                "messages_per_second must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Interval between dispatch scans
    #[must_use]
    pub const fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Interval between health check passes
    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_to_empty_source() -> Result<(), ConfigError> {
        let settings: Settings = Config::builder().build()?.try_deserialize()?;
        assert_eq!(settings.worker_name, "worker-1");
        assert_eq!(settings.messages_per_second, 15);
        assert_eq!(settings.scan_interval(), Duration::from_secs(10));
        assert_eq!(settings.health_check_interval(), Duration::from_secs(3600));
        assert_eq!(settings.media_cache_ttl_secs, 2_592_000);
        assert!(settings.encryption_key.is_none());
        Ok(())
    }

    #[test]
    fn test_zero_rate_is_rejected() -> Result<(), ConfigError> {
        let settings: Settings = Config::builder()
            .set_override("messages_per_second", 0)?
            .build()?
            .try_deserialize()?;
        assert!(settings.validate().is_err());
        Ok(())
    }
}
