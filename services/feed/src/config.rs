use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Placeholder in [`S3Config::base_url`] replaced by the object key
pub const KEY_PLACEHOLDER: &str = "{key}";

/// Main configuration for the feed service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Remote bucket configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Background refresh configuration
    #[serde(default)]
    pub refresh: RefreshConfig,
    /// Snapshot filtering and response sizing
    #[serde(default)]
    pub snapshot: SnapshotConfig,
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
    /// Log output format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port, 0 disables the Prometheus exporter
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port. Required, there is no default.
    #[serde(default)]
    pub port: String,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Gzip-compress responses
    #[serde(default = "default_true")]
    pub compression: bool,
    /// Requests taking longer than this are answered with 408
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// S3 listing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding the camera videos
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Only list keys under this prefix
    pub prefix: Option<String>,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Send unsigned requests (public buckets)
    #[serde(default = "default_true")]
    pub anonymous: bool,
    /// Keys requested per listing page
    #[serde(default = "default_page_size")]
    pub page_size: i32,
    /// Public URL template for items, `{key}` is replaced by the object key
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

/// Background refresh configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Seconds between refresh cycles
    #[serde(default = "default_refresh_interval_secs")]
    pub interval_secs: u64,
    /// Upper bound on a single refresh cycle in seconds
    #[serde(default = "default_refresh_timeout_secs")]
    pub timeout_secs: u64,
    /// Delay further attempts after consecutive failures
    #[serde(default = "default_true")]
    pub backoff_enabled: bool,
    /// First backoff delay in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Snapshot filtering and response sizing
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    /// Only keys ending with this suffix are published
    #[serde(default = "default_eligible_suffix")]
    pub eligible_suffix: String,
    /// Maximum number of items returned by the latest videos endpoint
    #[serde(default = "default_max_items")]
    pub max_items: usize,
}

/// Configuration errors. Any of these is fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingField(String),

    #[error("Invalid configuration value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

// Default value functions
fn default_service_name() -> String {
    "camjam-feed".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_bucket() -> String {
    "jamcams.tfl.gov.uk".to_string()
}

fn default_region() -> String {
    "eu-west-1".to_string()
}

fn default_page_size() -> i32 {
    1000
}

fn default_base_url() -> String {
    "https://s3-eu-west-1.amazonaws.com/jamcams.tfl.gov.uk/{key}".to_string()
}

fn default_refresh_interval_secs() -> u64 {
    10
}

fn default_refresh_timeout_secs() -> u64 {
    30
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_eligible_suffix() -> String {
    ".mp4".to_string()
}

fn default_max_items() -> usize {
    50
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/feed").required(false))
            .add_source(config::File::with_name("/etc/camjam/feed").required(false))
            // FEED__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("FEED")
                    .separator("__")
                    .try_parsing(true),
            )
            // Plain PORT wins over everything else
            .set_override_option("api.port", std::env::var("PORT").ok())?
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Validate the configuration before anything is started
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api.port_number()?;

        if self.api.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "api.request_timeout_secs".to_string(),
                message: "Request timeout must be greater than 0".to_string(),
            });
        }

        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigError::MissingField("s3.bucket".to_string()));
        }

        if self.s3.page_size <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "s3.page_size".to_string(),
                message: "Page size must be greater than 0".to_string(),
            });
        }

        if !self.s3.base_url.contains(KEY_PLACEHOLDER) {
            return Err(ConfigError::InvalidValue {
                field: "s3.base_url".to_string(),
                message: format!("Template must contain {}", KEY_PLACEHOLDER),
            });
        }

        if self.refresh.interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "refresh.interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        if self.refresh.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "refresh.timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        if self.refresh.backoff_initial_ms > self.refresh.backoff_max_ms {
            return Err(ConfigError::InvalidValue {
                field: "refresh.backoff_initial_ms".to_string(),
                message: "Initial backoff exceeds maximum backoff".to_string(),
            });
        }

        if self.snapshot.eligible_suffix.is_empty() {
            return Err(ConfigError::MissingField(
                "snapshot.eligible_suffix".to_string(),
            ));
        }

        if self.snapshot.max_items == 0 {
            return Err(ConfigError::InvalidValue {
                field: "snapshot.max_items".to_string(),
                message: "Must return at least one item".to_string(),
            });
        }

        Ok(())
    }
}

impl ApiConfig {
    /// Parse the configured port. Accepts the `:8080` form as well.
    pub fn port_number(&self) -> Result<u16, ConfigError> {
        let raw = self.port.trim().trim_start_matches(':');

        if raw.is_empty() {
            return Err(ConfigError::MissingField("api.port".to_string()));
        }

        raw.parse::<u16>().map_err(|e| ConfigError::InvalidValue {
            field: "api.port".to_string(),
            message: format!("{:?} is not a port number: {}", self.port, e),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Address the HTTP server binds to
    pub fn listen_addr(&self) -> Result<String, ConfigError> {
        Ok(format!("{}:{}", self.host, self.port_number()?))
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: String::new(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            compression: true,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            prefix: None,
            endpoint_url: None,
            force_path_style: false,
            anonymous: true,
            page_size: default_page_size(),
            base_url: default_base_url(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_refresh_interval_secs(),
            timeout_secs: default_refresh_timeout_secs(),
            backoff_enabled: true,
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            eligible_suffix: default_eligible_suffix(),
            max_items: default_max_items(),
        }
    }
}
