//! Detector, decompression and endpoint configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Region used when `init` is given none.
pub const DEFAULT_REGION: &str = "cn-shanghai";

/// Immutable run parameters for a detector.
///
/// Set before `init`; read-only while the detector runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Number of worker threads.
    pub pool_size: usize,
    /// Maximum number of admitted, unfinished tasks.
    pub max_queued_tasks: usize,
    /// Minimum time between two remote polls of the same task.
    pub min_poll_interval_ms: u64,
    /// Delay before retrying a throttled remote call.
    pub throttle_backoff_ms: u64,
    /// Connection timeout handed to the remote client.
    pub connect_timeout_ms: u64,
    /// Read timeout handed to the remote client.
    pub read_timeout_ms: u64,
    /// Upload timeout handed to the remote client.
    pub upload_timeout_ms: u64,
    /// Page size for archive member listing.
    pub archive_page_size: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            pool_size: 64,
            max_queued_tasks: 200,
            min_poll_interval_ms: 100,
            throttle_backoff_ms: 100,
            connect_timeout_ms: 6_000,
            read_timeout_ms: 6_000,
            upload_timeout_ms: 60_000,
            archive_page_size: 50,
        }
    }
}

impl DetectorConfig {
    /// Configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the admission limit.
    #[must_use]
    pub const fn with_max_queued_tasks(mut self, max: usize) -> Self {
        self.max_queued_tasks = max;
        self
    }

    /// Set the minimum per-task poll interval.
    #[must_use]
    pub const fn with_min_poll_interval_ms(mut self, ms: u64) -> Self {
        self.min_poll_interval_ms = ms;
        self
    }

    /// Set the throttling backoff.
    #[must_use]
    pub const fn with_throttle_backoff_ms(mut self, ms: u64) -> Self {
        self.throttle_backoff_ms = ms;
        self
    }

    /// Set connect, read and upload timeouts.
    #[must_use]
    pub const fn with_timeouts_ms(mut self, connect: u64, read: u64, upload: u64) -> Self {
        self.connect_timeout_ms = connect;
        self.read_timeout_ms = read;
        self.upload_timeout_ms = upload;
        self
    }

    /// Set the archive listing page size.
    #[must_use]
    pub const fn with_archive_page_size(mut self, size: usize) -> Self {
        self.archive_page_size = size;
        self
    }

    /// Minimum poll interval as a `Duration`.
    #[must_use]
    pub const fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }

    /// Throttling backoff as a `Duration`.
    #[must_use]
    pub const fn throttle_backoff(&self) -> Duration {
        Duration::from_millis(self.throttle_backoff_ms)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("pool_size must be greater than 0".into());
        }
        if self.max_queued_tasks == 0 {
            return Err("max_queued_tasks must be greater than 0".into());
        }
        if self.archive_page_size == 0 {
            return Err("archive_page_size must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate. Missing fields keep
    /// their defaults.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from `DETECT_*` environment variables, loading a
    /// `.env` file first if one exists. Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns a message naming the variable that failed to parse, or a
    /// validation message.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn read<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            slot: &mut T,
        ) -> Result<(), String> {
            if let Some(raw) = lookup(key) {
                *slot = raw
                    .trim()
                    .parse()
                    .map_err(|_| format!("{key}: cannot parse `{raw}`"))?;
            }
            Ok(())
        }

        let mut cfg = Self::default();
        read(&lookup, "DETECT_POOL_SIZE", &mut cfg.pool_size)?;
        read(&lookup, "DETECT_MAX_QUEUED_TASKS", &mut cfg.max_queued_tasks)?;
        read(&lookup, "DETECT_MIN_POLL_INTERVAL_MS", &mut cfg.min_poll_interval_ms)?;
        read(&lookup, "DETECT_THROTTLE_BACKOFF_MS", &mut cfg.throttle_backoff_ms)?;
        read(&lookup, "DETECT_CONNECT_TIMEOUT_MS", &mut cfg.connect_timeout_ms)?;
        read(&lookup, "DETECT_READ_TIMEOUT_MS", &mut cfg.read_timeout_ms)?;
        read(&lookup, "DETECT_UPLOAD_TIMEOUT_MS", &mut cfg.upload_timeout_ms)?;
        read(&lookup, "DETECT_ARCHIVE_PAGE_SIZE", &mut cfg.archive_page_size)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Whether and how deep the service should unpack archive samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompressPolicy {
    /// Unpack archives and report member results.
    pub enabled: bool,
    /// Maximum nesting depth to unpack.
    pub max_layers: u32,
    /// Maximum number of members to unpack.
    pub max_file_count: u32,
}

impl Default for DecompressPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_layers: 5,
            max_file_count: 1000,
        }
    }
}

impl DecompressPolicy {
    /// Policy with decompression turned on and the given limits.
    #[must_use]
    pub const fn enabled(max_layers: u32, max_file_count: u32) -> Self {
        Self {
            enabled: true,
            max_layers,
            max_file_count,
        }
    }
}

/// Which service deployment a region is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// Mainland deployment.
    Domestic,
    /// International deployment.
    International,
}

impl Endpoint {
    /// Resolve the deployment serving `region`, defaulting to [`DEFAULT_REGION`].
    ///
    /// ```
    /// use detect_lot::config::Endpoint;
    ///
    /// assert_eq!(Endpoint::for_region(None), Endpoint::Domestic);
    /// assert_eq!(Endpoint::for_region(Some("cn-hangzhou")), Endpoint::Domestic);
    /// assert_eq!(Endpoint::for_region(Some("ap-southeast-1")), Endpoint::International);
    /// ```
    #[must_use]
    pub fn for_region(region: Option<&str>) -> Self {
        let region = region.unwrap_or(DEFAULT_REGION);
        if region.contains('-') && !region.starts_with("cn-") {
            Self::International
        } else {
            Self::Domestic
        }
    }
}
