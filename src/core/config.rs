use crate::core::errors::{Result, ScoutError};
use crate::store::path as store_path;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Coordination engine configuration with all tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    // Identity pool
    /// Prefix of pool codes (`A` gives `A1..A25`)
    pub pool_prefix: String,
    /// Number of codes in the pool
    pub pool_size: usize,
    /// Attempts to claim a pool code before falling back
    pub allocation_attempts: u32,
    /// Linear backoff step between claim attempts
    pub allocation_backoff: Duration,
    /// Attempts to find a free slug identity
    pub local_id_attempts: u32,

    // Presence
    /// Window in which a name counts as live
    pub name_grace: Duration,
    /// Age after which a conflicting identity may be evicted
    pub stale_threshold: Duration,

    // Matches
    /// Maximum number of slotted participants per match
    pub max_slots: usize,

    // Sessions
    /// Whole word in a display name that marks a privileged login
    pub privileged_keyword: String,
    /// Lifetime of the suppress-auto-signin hint
    pub suppress_signin_ttl: Duration,
    /// Delay before logout clears the suppress-auto-signin hint
    pub logout_clear_delay: Duration,
    /// Lifetime of the suppress-presence-on-unload hint
    pub unload_suppress_ttl: Duration,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            pool_prefix: "A".to_string(),
            pool_size: 25,
            allocation_attempts: 6,
            allocation_backoff: Duration::from_millis(50),
            local_id_attempts: 6,

            name_grace: Duration::from_secs(2 * 60),
            stale_threshold: Duration::from_secs(12 * 60 * 60),

            max_slots: 6,

            privileged_keyword: "lead".to_string(),
            suppress_signin_ttl: Duration::from_secs(10),
            logout_clear_delay: Duration::from_secs(5),
            unload_suppress_ttl: Duration::from_secs(10),
        }
    }
}

impl CoordConfig {
    /// Create a new builder for CoordConfig
    pub fn builder() -> CoordConfigBuilder {
        CoordConfigBuilder::new()
    }

    /// Parse a YAML document; missing fields keep their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CoordConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ScoutError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&raw)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool_prefix.is_empty() {
            return Err(ScoutError::configuration_field(
                "pool_prefix cannot be empty",
                "pool_prefix",
            ));
        }
        if !store_path::is_valid_key(&self.pool_prefix) || self.pool_prefix.contains(':') {
            return Err(ScoutError::configuration_field(
                "pool_prefix must be a valid store key without ':'",
                "pool_prefix",
            ));
        }
        if self.allocation_attempts == 0 {
            return Err(ScoutError::configuration_field(
                "allocation_attempts must be greater than 0",
                "allocation_attempts",
            ));
        }
        if self.local_id_attempts == 0 {
            return Err(ScoutError::configuration_field(
                "local_id_attempts must be greater than 0",
                "local_id_attempts",
            ));
        }
        if self.stale_threshold < self.name_grace {
            return Err(ScoutError::configuration_field(
                "stale_threshold cannot be shorter than name_grace",
                "stale_threshold",
            ));
        }
        if self.max_slots == 0 {
            return Err(ScoutError::configuration_field(
                "max_slots must be greater than 0",
                "max_slots",
            ));
        }
        if self.privileged_keyword.trim().is_empty() {
            return Err(ScoutError::configuration_field(
                "privileged_keyword cannot be empty",
                "privileged_keyword",
            ));
        }
        if self.logout_clear_delay > self.suppress_signin_ttl {
            return Err(ScoutError::configuration_field(
                "logout_clear_delay cannot exceed suppress_signin_ttl",
                "logout_clear_delay",
            ));
        }
        Ok(())
    }

    /// Short windows for tests and local runs
    pub fn development() -> Self {
        Self {
            allocation_backoff: Duration::from_millis(1),
            suppress_signin_ttl: Duration::from_millis(500),
            logout_clear_delay: Duration::from_millis(50),
            unload_suppress_ttl: Duration::from_millis(500),
            ..Default::default()
        }
    }
}

/// Builder for CoordConfig
pub struct CoordConfigBuilder {
    config: CoordConfig,
}

impl CoordConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: CoordConfig::default(),
        }
    }

    /// Set the identity pool namespace
    pub fn pool(mut self, prefix: impl Into<String>, size: usize) -> Self {
        self.config.pool_prefix = prefix.into();
        self.config.pool_size = size;
        self
    }

    /// Set allocation retry behaviour
    pub fn allocation_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.config.allocation_attempts = attempts;
        self.config.allocation_backoff = backoff;
        self
    }

    pub fn name_grace(mut self, grace: Duration) -> Self {
        self.config.name_grace = grace;
        self
    }

    pub fn stale_threshold(mut self, threshold: Duration) -> Self {
        self.config.stale_threshold = threshold;
        self
    }

    pub fn max_slots(mut self, slots: usize) -> Self {
        self.config.max_slots = slots;
        self
    }

    pub fn privileged_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.config.privileged_keyword = keyword.into();
        self
    }

    /// Set logout suppression windows
    pub fn logout_windows(mut self, signin_ttl: Duration, clear_delay: Duration) -> Self {
        self.config.suppress_signin_ttl = signin_ttl;
        self.config.logout_clear_delay = clear_delay;
        self
    }

    pub fn unload_suppress_ttl(mut self, ttl: Duration) -> Self {
        self.config.unload_suppress_ttl = ttl;
        self
    }

    pub fn build(self) -> Result<CoordConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for CoordConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Store server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// sled database used for snapshots; `None` keeps everything in memory
    pub snapshot_path: Option<PathBuf>,
    /// zstd level for snapshot blobs
    pub compression_level: i32,
    /// Capacity of the change feed broadcast channel
    pub change_feed_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            compression_level: 3,
            change_feed_capacity: 1024,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=22).contains(&self.compression_level) {
            return Err(ScoutError::configuration_field(
                "compression_level must be between 1 and 22",
                "compression_level",
            ));
        }
        if self.change_feed_capacity == 0 {
            return Err(ScoutError::configuration_field(
                "change_feed_capacity must be greater than 0",
                "change_feed_capacity",
            ));
        }
        Ok(())
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }
}
