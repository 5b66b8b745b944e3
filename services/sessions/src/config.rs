use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Minimum part size accepted by S3 for every part but the last
const S3_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Errors raised while validating a loaded configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the session service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Blob store (S3) configuration
    pub blob_store: BlobStoreConfig,
    /// Video upload policy
    #[serde(default)]
    pub uploads: UploadConfig,
    /// Session retention policy
    #[serde(default)]
    pub retention: RetentionConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// S3-compatible blob storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BlobStoreConfig {
    /// Bucket holding uploaded videos
    pub bucket: String,
    /// Key prefix under which blobs are written
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Multipart upload threshold in bytes
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Limits applied to uploaded videos
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Maximum accepted video size in bytes
    #[serde(default = "default_max_video_size")]
    pub max_video_size: usize,
    /// Accepted video MIME types
    #[serde(default = "default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,
}

/// Age-based expiration of sessions
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Run the background sweeper
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sessions older than this many days (by creation time) are expired
    #[serde(default = "default_retention_days")]
    pub days: u32,
    /// Interval between sweeps in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Allowed CORS origins ("*" allows any)
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "session-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_key_prefix() -> String {
    "videos".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_part_size() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_max_video_size() -> usize {
    100 * 1024 * 1024 // 100MB
}

fn default_allowed_content_types() -> Vec<String> {
    vec![
        "video/mp4".to_string(),
        "video/quicktime".to_string(),
        "video/x-msvideo".to_string(),
    ]
}

fn default_retention_days() -> u32 {
    90
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("database.url", "postgres://localhost:5432/emo_now")?
            .set_default("blob_store.bucket", "emo-now-videos")?
            // Add config file if present
            .add_source(config::File::with_name("config/sessions").required(false))
            .add_source(config::File::with_name("/etc/emo-now/sessions").required(false))
            // Override with environment variables
            // EMO__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("EMO")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("api.cors_origins")
                    .with_list_parse_key("uploads.allowed_content_types"),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the service cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::MissingRequired("database.url".to_string()));
        }

        if self.blob_store.bucket.is_empty() {
            return Err(ConfigError::MissingRequired("blob_store.bucket".to_string()));
        }

        if self.uploads.max_video_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "uploads.max_video_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.uploads.allowed_content_types.is_empty() {
            return Err(ConfigError::MissingRequired(
                "uploads.allowed_content_types".to_string(),
            ));
        }

        if self.retention.days == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retention.days".to_string(),
                message: "must be at least one day".to_string(),
            });
        }

        if self.retention.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retention.sweep_interval_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.blob_store.part_size_bytes < S3_MIN_PART_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "blob_store.part_size_bytes".to_string(),
                message: format!("must be at least {} bytes", S3_MIN_PART_SIZE),
            });
        }

        Ok(())
    }

    /// Get the retention window as a chrono duration
    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention.days))
    }

    /// Get the sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention.sweep_interval_secs)
    }
}

impl DatabaseConfig {
    /// Pool acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Idle connection timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_video_size: default_max_video_size(),
            allowed_content_types: default_allowed_content_types(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/emo_test".to_string(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout_secs(),
                idle_timeout_secs: default_idle_timeout_secs(),
                run_migrations: true,
            },
            blob_store: BlobStoreConfig {
                bucket: "videos".to_string(),
                key_prefix: default_key_prefix(),
                region: default_region(),
                endpoint_url: None,
                force_path_style: false,
                connect_timeout_secs: default_connect_timeout_secs(),
                multipart_threshold_bytes: default_multipart_threshold(),
                part_size_bytes: default_part_size(),
            },
            uploads: UploadConfig::default(),
            retention: RetentionConfig::default(),
            api: ApiConfig::default(),
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_video_size(), 104_857_600);
        assert_eq!(default_retention_days(), 90);
        assert_eq!(default_api_port(), 8000);
        assert_eq!(default_allowed_content_types().len(), 3);
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_retention() {
        let mut config = test_config();
        config.retention.days = 0;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "retention.days"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_sweep_interval() {
        let mut config = test_config();
        config.retention.sweep_interval_secs = 0;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "retention.sweep_interval_secs"
        ));
    }

    #[test]
    fn test_validate_rejects_small_parts() {
        let mut config = test_config();
        config.blob_store.part_size_bytes = 1024;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retention_window() {
        let config = test_config();
        assert_eq!(config.retention_window().num_days(), 90);
    }
}
