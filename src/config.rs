//! Configuration management for Ratekeeper.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RatekeeperError, Result};
use crate::ratelimit::{Algorithm, FailurePolicy, RateLimiter, RateLimiterBuilder};
use crate::storage::{LocalStorageOptions, RemoteClient, RemoteStorage, RemoteStorageOptions};

/// Prefix of environment variables overriding file settings.
const ENV_PREFIX: &str = "RATEKEEPER";
/// Separator between nested keys in environment variable names.
const ENV_SEPARATOR: &str = "__";

/// Main configuration for Ratekeeper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Requests admitted per window; zero denies everything
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Admission algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Count requests without denying them
    #[serde(default)]
    pub draft_mode: bool,

    /// Behavior on key extraction and storage failures
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Interval between sweeps of full token buckets in milliseconds; zero disables them
    #[serde(default = "default_bucket_sweep_interval_ms")]
    pub bucket_sweep_interval_ms: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            algorithm: Algorithm::default(),
            draft_mode: false,
            failure_policy: FailurePolicy::default(),
            bucket_sweep_interval_ms: default_bucket_sweep_interval_ms(),
        }
    }
}

fn default_window_ms() -> u64 {
    crate::ratelimit::DEFAULT_WINDOW.as_millis() as u64
}

fn default_max_requests() -> u64 {
    crate::ratelimit::DEFAULT_MAX_REQUESTS
}

fn default_bucket_sweep_interval_ms() -> u64 {
    crate::ratelimit::DEFAULT_BUCKET_SWEEP_INTERVAL.as_millis() as u64
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Interval between local storage sweeps in milliseconds; zero disables them
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// How long local timestamp logs are kept, in milliseconds
    #[serde(default = "default_log_retention_ms")]
    pub log_retention_ms: u64,

    /// Time budget of one local sweep in milliseconds
    #[serde(default = "default_sweep_budget_ms")]
    pub sweep_budget_ms: u64,

    /// Prefix for keys written to a remote backend
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Propagate remote backend failures instead of degrading
    #[serde(default)]
    pub strict: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: default_cleanup_interval_ms(),
            log_retention_ms: default_log_retention_ms(),
            sweep_budget_ms: default_sweep_budget_ms(),
            key_prefix: default_key_prefix(),
            strict: false,
        }
    }
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_log_retention_ms() -> u64 {
    3_600_000
}

fn default_sweep_budget_ms() -> u64 {
    10
}

fn default_key_prefix() -> String {
    "ratekeeper:".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RatekeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file overlaid with
    /// `RATEKEEPER__<SECTION>__<FIELD>` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: RatekeeperConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.window_ms == 0 {
            return Err(RatekeeperError::Config(
                "limiter.window_ms must be positive".to_string(),
            ));
        }
        if self.storage.key_prefix.is_empty() {
            return Err(RatekeeperError::Config(
                "storage.key_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Build a limiter on local storage from these settings.
    pub fn build_limiter(&self) -> Result<RateLimiter> {
        self.limiter
            .builder()
            .local_storage_options(self.storage.local_options())
            .build()
    }

    /// Build a limiter counting on a shared backend reached through `client`.
    ///
    /// The client is shared, so disposing the limiter leaves it open for
    /// other limiters on the same backend.
    pub fn build_remote_limiter<C>(&self, client: Arc<C>) -> Result<RateLimiter>
    where
        C: RemoteClient + 'static,
    {
        let storage = RemoteStorage::shared(client).with_options(self.storage.remote_options());
        self.limiter.builder().storage(Arc::new(storage)).build()
    }
}

impl LimiterSettings {
    /// A limiter builder preloaded with these settings.
    pub fn builder(&self) -> RateLimiterBuilder<str> {
        RateLimiter::builder()
            .window_ms(self.window_ms)
            .max_requests(self.max_requests)
            .algorithm(self.algorithm)
            .draft_mode(self.draft_mode)
            .failure_policy(self.failure_policy)
            .bucket_sweep_interval(Duration::from_millis(self.bucket_sweep_interval_ms))
    }
}

impl StorageSettings {
    /// Options for [`crate::storage::LocalStorage`].
    pub fn local_options(&self) -> LocalStorageOptions {
        LocalStorageOptions {
            cleanup_interval: Duration::from_millis(self.cleanup_interval_ms),
            log_retention: Duration::from_millis(self.log_retention_ms),
            sweep_budget: Duration::from_millis(self.sweep_budget_ms),
        }
    }

    /// Options for [`crate::storage::RemoteStorage`], as used by
    /// [`RatekeeperConfig::build_remote_limiter`].
    pub fn remote_options(&self) -> RemoteStorageOptions {
        RemoteStorageOptions {
            key_prefix: self.key_prefix.clone(),
            strict: self.strict,
        }
    }
}
