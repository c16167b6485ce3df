//! Configuration management for tripwatch.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::crypto::MIN_KDF_ITERATIONS;
use crate::error::{Error, Result};
use crate::position::{AcquisitionOptions, SourceKind};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "tripwatch";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "buffer.db";

/// Default fallback store file name.
const FALLBACK_FILE_NAME: &str = "buffer.json";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `TRIPWATCH_`, sections split on `__`)
/// 2. TOML config file at `~/.config/tripwatch/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Who is being tracked.
    pub traveler: TravelerConfig,
    /// Local buffer configuration.
    pub storage: StorageConfig,
    /// Position sampling configuration.
    pub sampling: SamplingConfig,
    /// Upload configuration.
    pub upload: UploadConfig,
    /// Check-in monitoring configuration.
    pub check_in: CheckInConfig,
    /// Record encryption configuration.
    pub crypto: CryptoConfig,
}

/// Traveler identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TravelerConfig {
    /// Traveler identifier; also the record key material.
    pub id: Option<String>,
}

/// Storage-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the preferred `SQLite` store.
    /// Defaults to `~/.local/share/tripwatch/buffer.db`
    pub database_path: Option<PathBuf>,
    /// Path to the fallback key/value file.
    /// Defaults to `~/.local/share/tripwatch/buffer.json`
    pub fallback_path: Option<PathBuf>,
    /// Attempts to open the preferred store before falling back.
    pub open_attempts: u32,
    /// Pause between open attempts in milliseconds.
    pub open_retry_delay_ms: u64,
    /// Maximum records kept in the online tier.
    pub online_capacity: usize,
    /// Maximum records kept in the offline tier.
    pub offline_capacity: usize,
    /// Minimum movement before another online sample is admitted.
    pub online_min_distance_m: f64,
    /// Minimum movement before another offline sample is admitted.
    pub offline_min_distance_m: f64,
}

/// How positions are acquired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    /// One-shot reads on a timer.
    #[default]
    Periodic,
    /// A continuous watch stream, throttled to the current cadence.
    Watch,
}

/// Sampling-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Acquisition mode.
    pub mode: SamplingMode,
    /// Normal cadence in seconds.
    pub interval_secs: u64,
    /// Cadence while the battery is low, in seconds.
    pub low_battery_interval_secs: u64,
    /// Battery percentage below which the low-battery cadence applies.
    pub low_battery_threshold_percent: u8,
    /// How often the battery level is polled, in seconds.
    pub battery_poll_secs: u64,
    /// Accuracy ceiling for a dedicated device sensor, in meters.
    pub device_accuracy_ceiling_m: f64,
    /// Accuracy ceiling for a browser-style geolocation API, in meters.
    pub browser_accuracy_ceiling_m: f64,
    /// Request high-accuracy fixes.
    pub high_accuracy: bool,
    /// Per-acquisition timeout in milliseconds.
    pub acquisition_timeout_ms: u64,
    /// Maximum age of a cached fix in milliseconds.
    pub max_age_ms: u64,
    /// Resolve a street address for each fix.
    pub resolve_addresses: bool,
    /// Combined buffered records that request an upload while online.
    pub online_upload_threshold: usize,
    /// Combined buffered records that request an upload while offline.
    pub offline_upload_threshold: usize,
}

/// Upload-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// HTTP endpoint receiving position batches. Logs batches when unset.
    pub endpoint: Option<String>,
    /// Bearer token sent with each batch.
    pub auth_token: Option<String>,
    /// Records per upload request.
    pub chunk_size: usize,
    /// Hard timeout per chunk, in seconds.
    pub chunk_timeout_secs: u64,
    /// Time-based upload trigger, in seconds.
    pub periodic_interval_secs: u64,
    /// First retry delay in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Retry delay cap in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Retries before a batch is dropped.
    pub max_retries: u32,
}

/// Check-in monitoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckInConfig {
    /// Evaluation cadence in seconds.
    pub interval_secs: u64,
    /// Grace window after a missed deadline, in minutes.
    pub grace_period_minutes: u32,
    /// Maximum distance from a destination for an automatic check-in.
    pub radius_m: f64,
    /// Oldest position a check-in may rely on, in seconds. Twice the
    /// sampling cadence when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_position_age_secs: Option<u64>,
}

/// Record encryption configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// PBKDF2 rounds per record key.
    pub kdf_iterations: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            fallback_path: None,
            open_attempts: 3,
            open_retry_delay_ms: 1000,
            online_capacity: 10,
            offline_capacity: 20,
            online_min_distance_m: 20.0,
            offline_min_distance_m: 50.0,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            mode: SamplingMode::Periodic,
            interval_secs: 30,
            low_battery_interval_secs: 120,
            low_battery_threshold_percent: 15,
            battery_poll_secs: 60,
            device_accuracy_ceiling_m: 10.0,
            browser_accuracy_ceiling_m: 100.0,
            high_accuracy: true,
            acquisition_timeout_ms: 15_000,
            max_age_ms: 10_000,
            resolve_addresses: true,
            online_upload_threshold: 10,
            offline_upload_threshold: 20,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            auth_token: None,
            chunk_size: 50,
            chunk_timeout_secs: 30,
            periodic_interval_secs: 300,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            max_retries: 5,
        }
    }
}

impl Default for CheckInConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            grace_period_minutes: 10,
            radius_m: 2000.0,
            max_position_age_secs: None,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: MIN_KDF_ITERATIONS,
        }
    }
}

impl SamplingConfig {
    /// Normal cadence.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Low-battery cadence.
    #[must_use]
    pub fn low_battery_interval(&self) -> Duration {
        Duration::from_secs(self.low_battery_interval_secs)
    }

    /// Cadence for the given battery mode.
    #[must_use]
    pub fn interval_for(&self, low_battery: bool) -> Duration {
        if low_battery {
            self.low_battery_interval()
        } else {
            self.interval()
        }
    }

    /// Battery polling cadence.
    #[must_use]
    pub fn battery_poll_interval(&self) -> Duration {
        Duration::from_secs(self.battery_poll_secs)
    }

    /// Accuracy ceiling for a source kind.
    #[must_use]
    pub fn accuracy_ceiling(&self, kind: SourceKind) -> f64 {
        match kind {
            SourceKind::DeviceSensor => self.device_accuracy_ceiling_m,
            SourceKind::BrowserGeolocation => self.browser_accuracy_ceiling_m,
        }
    }

    /// Options passed to the position source.
    #[must_use]
    pub fn acquisition_options(&self) -> AcquisitionOptions {
        AcquisitionOptions {
            high_accuracy: self.high_accuracy,
            timeout_ms: self.acquisition_timeout_ms,
            max_age_ms: self.max_age_ms,
        }
    }

    /// Combined record count that requests an upload.
    #[must_use]
    pub fn upload_threshold(&self, online: bool) -> usize {
        if online {
            self.online_upload_threshold
        } else {
            self.offline_upload_threshold
        }
    }
}

impl UploadConfig {
    /// Per-chunk timeout.
    #[must_use]
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    /// Time-based upload trigger.
    #[must_use]
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }

    /// First retry delay.
    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Retry delay cap.
    #[must_use]
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

impl CheckInConfig {
    /// Evaluation cadence.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Grace window.
    #[must_use]
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.grace_period_minutes))
    }

    /// Oldest position a check-in may rely on while sampling every `cadence`.
    #[must_use]
    pub fn max_position_age(&self, cadence: Duration) -> Duration {
        self.max_position_age_secs.map_or(cadence.saturating_mul(2), Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("TRIPWATCH_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.crypto.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(Error::config(format!(
                "kdf_iterations ({}) must be at least {MIN_KDF_ITERATIONS}",
                self.crypto.kdf_iterations
            )));
        }

        if self.storage.open_attempts == 0 {
            return Err(Error::config("open_attempts must be greater than 0"));
        }
        if self.storage.online_capacity == 0 || self.storage.offline_capacity == 0 {
            return Err(Error::config("tier capacities must be greater than 0"));
        }
        if self.storage.online_min_distance_m < 0.0 || self.storage.offline_min_distance_m < 0.0 {
            return Err(Error::config("minimum distances cannot be negative"));
        }

        if self.sampling.interval_secs == 0 || self.sampling.low_battery_interval_secs == 0 {
            return Err(Error::config("sampling intervals must be greater than 0"));
        }
        if self.sampling.battery_poll_secs == 0 {
            return Err(Error::config("battery_poll_secs must be greater than 0"));
        }
        if self.sampling.low_battery_threshold_percent > 100 {
            return Err(Error::config(format!(
                "low_battery_threshold_percent ({}) cannot exceed 100",
                self.sampling.low_battery_threshold_percent
            )));
        }

        if self.upload.chunk_size == 0 {
            return Err(Error::config("chunk_size must be greater than 0"));
        }
        if self.upload.chunk_timeout_secs == 0 || self.upload.periodic_interval_secs == 0 {
            return Err(Error::config("upload timeouts and intervals must be greater than 0"));
        }
        if self.upload.retry_max_delay_ms < self.upload.retry_base_delay_ms {
            return Err(Error::config(format!(
                "retry_max_delay_ms ({}) cannot be less than retry_base_delay_ms ({})",
                self.upload.retry_max_delay_ms, self.upload.retry_base_delay_ms
            )));
        }
        if let Some(endpoint) = &self.upload.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(Error::config(format!("invalid upload endpoint: {endpoint}")));
            }
        }

        if self.check_in.interval_secs == 0 {
            return Err(Error::config("check_in interval_secs must be greater than 0"));
        }
        if self.check_in.radius_m <= 0.0 {
            return Err(Error::config("check_in radius_m must be positive"));
        }
        if self.check_in.max_position_age_secs == Some(0) {
            return Err(Error::config("check_in max_position_age_secs must be greater than 0"));
        }

        Ok(())
    }

    /// Get the traveler id, which every pipeline command needs.
    ///
    /// # Errors
    ///
    /// Returns an error if no traveler id is configured.
    pub fn traveler_id(&self) -> Result<&str> {
        match self.traveler.id.as_deref() {
            Some(id) if !id.trim().is_empty() => Ok(id),
            _ => Err(Error::config(
                "traveler.id must be set (config file or TRIPWATCH_TRAVELER__ID)",
            )),
        }
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the fallback store path, resolving defaults if not set.
    #[must_use]
    pub fn fallback_path(&self) -> PathBuf {
        self.storage
            .fallback_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(FALLBACK_FILE_NAME))
    }
}
