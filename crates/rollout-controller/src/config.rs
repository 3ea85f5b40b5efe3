//! Rollout Controller configuration.
//!
//! Process settings come from environment variables. The set of tracked
//! images comes from a YAML file whose path is itself configurable.

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Default rate limit in requests per minute per caller.
pub const DEFAULT_RATE_LIMIT_RPM: u32 = 30;

/// Default key rotation interval (24 hours).
pub const DEFAULT_KEY_ROTATION_INTERVAL_SECONDS: u64 = 24 * 60 * 60;

/// Default grace window for the previous webhook key (15 minutes).
pub const DEFAULT_KEY_GRACE_PERIOD_SECONDS: u64 = 15 * 60;

/// Default registry token refresh interval (11 hours, inside the ~12h token lifetime).
pub const DEFAULT_REGISTRY_REFRESH_INTERVAL_SECONDS: u64 = 11 * 60 * 60;

/// Default deadline for a single container runtime call.
pub const DEFAULT_RUNTIME_CALL_TIMEOUT_SECONDS: u64 = 300;

/// Default interval between sweeps of stale rate limit entries.
pub const DEFAULT_RATE_LIMIT_SWEEP_INTERVAL_SECONDS: u64 = 300;

/// Default graceful shutdown drain period.
pub const DEFAULT_DRAIN_SECONDS: u64 = 5;

/// Default location of the tracked image file.
pub const DEFAULT_WATCHED_IMAGES_PATH: &str = "./conf/conf.yml";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Rollout Controller configuration.
#[derive(Clone)]
pub struct Config {
    /// Server bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Region of the secret store and container registry.
    pub region: String,

    /// Path of the YAML file listing tracked images.
    pub watched_images_path: String,

    /// Secret store entry holding the webhook key. Overrides `secretName`
    /// from the tracked image file when set.
    pub secret_name: Option<String>,

    /// Admission limit in requests per minute per caller.
    pub rate_limit_rpm: u32,

    /// Seconds between webhook key rotations.
    pub key_rotation_interval_seconds: u64,

    /// Seconds the previous webhook key stays valid after a rotation.
    pub key_grace_period_seconds: u64,

    /// Seconds between registry login token refreshes.
    pub registry_refresh_interval_seconds: u64,

    /// Deadline in seconds for each container runtime call.
    pub runtime_call_timeout_seconds: u64,

    /// Seconds between sweeps of stale rate limit entries.
    pub rate_limit_sweep_interval_seconds: u64,

    /// Seconds to wait for in-flight requests on shutdown.
    pub drain_seconds: u64,

    /// Log output format.
    pub log_format: LogFormat,
}

/// Redacts the secret store entry name.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("region", &self.region)
            .field("watched_images_path", &self.watched_images_path)
            .field("secret_name", &self.secret_name.as_ref().map(|_| "[REDACTED]"))
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("key_rotation_interval_seconds", &self.key_rotation_interval_seconds)
            .field("key_grace_period_seconds", &self.key_grace_period_seconds)
            .field("registry_refresh_interval_seconds", &self.registry_refresh_interval_seconds)
            .field("runtime_call_timeout_seconds", &self.runtime_call_timeout_seconds)
            .field("rate_limit_sweep_interval_seconds", &self.rate_limit_sweep_interval_seconds)
            .field("drain_seconds", &self.drain_seconds)
            .field("log_format", &self.log_format)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid rate limit configuration: {0}")]
    InvalidRateLimit(String),

    #[error("Invalid interval configuration: {0}")]
    InvalidInterval(String),

    #[error("Invalid log format: {0}")]
    InvalidLogFormat(String),

    #[error("No secret name configured: set SECRET_NAME or secretName in the tracked image file")]
    MissingSecretName,

    #[error("Failed to read tracked image file: {0}")]
    WatchedImagesUnreadable(String),

    #[error("Invalid tracked image configuration: {0}")]
    InvalidWatchedImages(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());

        let region = vars
            .get("AWS_REGION")
            .cloned()
            .unwrap_or_else(|| "eu-north-1".to_string());

        let watched_images_path = vars
            .get("WATCHED_IMAGES_PATH")
            .cloned()
            .unwrap_or_else(|| DEFAULT_WATCHED_IMAGES_PATH.to_string());

        let secret_name = vars
            .get("SECRET_NAME")
            .filter(|name| !name.is_empty())
            .cloned();

        // Parse rate limit with validation
        let rate_limit_rpm = if let Some(value_str) = vars.get("RATE_LIMIT_RPM") {
            let value: u32 = value_str.parse().map_err(|e| {
                ConfigError::InvalidRateLimit(format!(
                    "RATE_LIMIT_RPM must be a valid positive integer, got '{}': {}",
                    value_str, e
                ))
            })?;

            if value == 0 {
                return Err(ConfigError::InvalidRateLimit(
                    "RATE_LIMIT_RPM must be greater than 0".to_string(),
                ));
            }

            value
        } else {
            DEFAULT_RATE_LIMIT_RPM
        };

        let key_rotation_interval_seconds = parse_interval(
            vars,
            "KEY_ROTATION_INTERVAL_SECONDS",
            DEFAULT_KEY_ROTATION_INTERVAL_SECONDS,
        )?;
        let key_grace_period_seconds = parse_interval(
            vars,
            "KEY_GRACE_PERIOD_SECONDS",
            DEFAULT_KEY_GRACE_PERIOD_SECONDS,
        )?;
        let registry_refresh_interval_seconds = parse_interval(
            vars,
            "REGISTRY_REFRESH_INTERVAL_SECONDS",
            DEFAULT_REGISTRY_REFRESH_INTERVAL_SECONDS,
        )?;
        let runtime_call_timeout_seconds = parse_interval(
            vars,
            "RUNTIME_CALL_TIMEOUT_SECONDS",
            DEFAULT_RUNTIME_CALL_TIMEOUT_SECONDS,
        )?;
        let rate_limit_sweep_interval_seconds = parse_interval(
            vars,
            "RATE_LIMIT_SWEEP_INTERVAL_SECONDS",
            DEFAULT_RATE_LIMIT_SWEEP_INTERVAL_SECONDS,
        )?;

        // Zero is allowed here: it skips the drain period entirely
        let drain_seconds = match vars.get("DRAIN_SECONDS") {
            Some(value_str) => value_str.parse().map_err(|e| {
                ConfigError::InvalidInterval(format!(
                    "DRAIN_SECONDS must be a valid non-negative integer, got '{}': {}",
                    value_str, e
                ))
            })?,
            None => DEFAULT_DRAIN_SECONDS,
        };

        let log_format = match vars.get("LOG_FORMAT").map(|s| s.to_ascii_lowercase()) {
            None => LogFormat::Text,
            Some(format) if format == "text" => LogFormat::Text,
            Some(format) if format == "json" => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidLogFormat(format!(
                    "LOG_FORMAT must be 'text' or 'json', got '{}'",
                    other
                )))
            }
        };

        Ok(Config {
            bind_address,
            region,
            watched_images_path,
            secret_name,
            rate_limit_rpm,
            key_rotation_interval_seconds,
            key_grace_period_seconds,
            registry_refresh_interval_seconds,
            runtime_call_timeout_seconds,
            rate_limit_sweep_interval_seconds,
            drain_seconds,
            log_format,
        })
    }

    /// Pick the secret store entry name: `SECRET_NAME` wins over the file.
    pub fn resolve_secret_name(
        &self,
        watched: &WatchedImagesConfig,
    ) -> Result<String, ConfigError> {
        self.secret_name
            .clone()
            .or_else(|| watched.secret_name.clone().filter(|name| !name.is_empty()))
            .ok_or(ConfigError::MissingSecretName)
    }
}

fn parse_interval(
    vars: &HashMap<String, String>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(value_str) = vars.get(key) else {
        return Ok(default);
    };

    let value: u64 = value_str.parse().map_err(|e| {
        ConfigError::InvalidInterval(format!(
            "{} must be a valid positive integer, got '{}': {}",
            key, value_str, e
        ))
    })?;

    if value == 0 {
        return Err(ConfigError::InvalidInterval(format!(
            "{} must be greater than 0",
            key
        )));
    }

    Ok(value)
}

/// One tracked image entry from the YAML file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedImage {
    /// Registry repository name, e.g. `/app`.
    pub repository_name: String,
    /// Registry host and path prefix, e.g. `acct.dkr.ecr.eu-north-1.amazonaws.com/`.
    pub repository_uri: String,
    /// Tags starting with this prefix roll out to this slot.
    #[serde(default)]
    pub image_tag_prefix: String,
}

/// Contents of the tracked image file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedImagesConfig {
    /// Secret store entry holding the webhook key.
    #[serde(default)]
    pub secret_name: Option<String>,
    /// Tracked images in file order.
    #[serde(default)]
    pub watched_images: Vec<WatchedImage>,
}

impl WatchedImagesConfig {
    /// Read and validate the tracked image file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::WatchedImagesUnreadable(format!("{}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parse and validate tracked images from YAML text.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: WatchedImagesConfig = serde_yaml::from_str(contents)
            .map_err(|e| ConfigError::InvalidWatchedImages(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check field presence and that tag prefixes of one repository never overlap.
    ///
    /// Overlapping prefixes ("v1" and "v1.2") would make the slot that receives
    /// a tag like "v1.2.0" ambiguous.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut prefixes_by_repo: HashMap<&str, Vec<&str>> = HashMap::new();

        for image in &self.watched_images {
            let repo = image.repository_name.trim_start_matches('/');
            if repo.is_empty() {
                return Err(ConfigError::InvalidWatchedImages(
                    "repositoryName must not be empty".to_string(),
                ));
            }
            if image.repository_uri.trim().is_empty() {
                return Err(ConfigError::InvalidWatchedImages(format!(
                    "repositoryUri must not be empty for repository '{}'",
                    image.repository_name
                )));
            }

            let prefixes = prefixes_by_repo.entry(repo).or_default();
            let prefix = image.image_tag_prefix.as_str();
            for existing in prefixes.iter() {
                if *existing == prefix {
                    return Err(ConfigError::InvalidWatchedImages(format!(
                        "duplicate imageTagPrefix '{}' for repository '{}'",
                        prefix, image.repository_name
                    )));
                }
                if existing.starts_with(prefix) || prefix.starts_with(existing) {
                    return Err(ConfigError::InvalidWatchedImages(format!(
                        "imageTagPrefix '{}' overlaps '{}' for repository '{}'",
                        prefix, existing, image.repository_name
                    )));
                }
            }
            prefixes.push(prefix);
        }

        Ok(())
    }
}
