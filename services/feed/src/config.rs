use crate::feed::{FeedSettings, Retention, ResubscribePolicy};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the feed service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Mirrored tables
    #[serde(default)]
    pub feeds: FeedsConfig,
    /// Resubscribe backoff
    #[serde(default)]
    pub resubscribe: ResubscribeConfig,
    /// Weather polling
    #[serde(default)]
    pub weather: WeatherConfig,
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
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Install tables and notification triggers on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Tables mirrored by the service
#[derive(Debug, Clone, Deserialize)]
pub struct FeedsConfig {
    #[serde(default = "default_detections_feed")]
    pub detections: FeedConfig,
    #[serde(default = "default_person_counts_feed")]
    pub person_counts: FeedConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

/// One record feed
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Backing table
    pub table: String,
    /// Instant column the initial fetch orders by
    pub order_by: String,
    /// Records kept locally; absent or 0 keeps everything
    #[serde(default)]
    pub max_retained: Option<usize>,
    /// Collapse redelivered inserts by id
    #[serde(default = "default_true")]
    pub dedup_by_id: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_status_table")]
    pub table: String,
}

/// Backoff between resubscribe attempts
#[derive(Debug, Clone, Deserialize)]
pub struct ResubscribeConfig {
    #[serde(default = "default_resubscribe_initial_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_resubscribe_max_ms")]
    pub max_delay_ms: u64,
}

/// Weather poll configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WeatherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Open-Meteo base URL
    #[serde(default = "default_weather_base_url")]
    pub base_url: String,
    #[serde(default = "default_latitude")]
    pub latitude: f64,
    #[serde(default = "default_longitude")]
    pub longitude: f64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// API configuration for the dashboard endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "skywatch-feed".to_string()
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
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_detections_feed() -> FeedConfig {
    FeedConfig {
        table: "detections".to_string(),
        order_by: "timestamp".to_string(),
        max_retained: Some(50),
        dedup_by_id: true,
    }
}

fn default_person_counts_feed() -> FeedConfig {
    FeedConfig {
        table: "person_count".to_string(),
        order_by: "detected_at".to_string(),
        max_retained: None,
        dedup_by_id: true,
    }
}

fn default_status_table() -> String {
    "system_status".to_string()
}

fn default_resubscribe_initial_ms() -> u64 {
    1000
}

fn default_resubscribe_max_ms() -> u64 {
    60_000
}

fn default_weather_base_url() -> String {
    "https://api.open-meteo.com".to_string()
}

fn default_latitude() -> f64 {
    13.0735
}

fn default_longitude() -> f64 {
    77.5741
}

fn default_poll_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "skywatch-feed")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/feed").required(false))
            .add_source(config::File::with_name("/etc/skywatch/feed").required(false))
            // Override with environment variables
            // SKYWATCH__DATABASE__URL -> database.url
            // SKYWATCH__FEEDS__DETECTIONS__MAX_RETAINED -> feeds.detections.max_retained
            .add_source(
                config::Environment::with_prefix("SKYWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Reject values the workers cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.weather.poll_interval_secs == 0 {
            anyhow::bail!("weather.poll_interval_secs must be at least 1");
        }
        if self.resubscribe.initial_delay_ms == 0 {
            anyhow::bail!("resubscribe.initial_delay_ms must be at least 1");
        }
        if self.resubscribe.max_delay_ms < self.resubscribe.initial_delay_ms {
            anyhow::bail!(
                "resubscribe.max_delay_ms ({}) is below resubscribe.initial_delay_ms ({})",
                self.resubscribe.max_delay_ms,
                self.resubscribe.initial_delay_ms
            );
        }

        Ok(())
    }

    /// Get the weather poll interval as Duration
    pub fn weather_poll_interval(&self) -> Duration {
        Duration::from_secs(self.weather.poll_interval_secs)
    }

    pub fn resubscribe_policy(&self) -> ResubscribePolicy {
        ResubscribePolicy {
            initial_delay: Duration::from_millis(self.resubscribe.initial_delay_ms),
            max_delay: Duration::from_millis(self.resubscribe.max_delay_ms),
        }
    }
}

impl FeedConfig {
    /// Store settings for the feed called `name`
    pub fn settings(&self, name: &str) -> FeedSettings {
        FeedSettings {
            name: name.to_string(),
            table: self.table.clone(),
            order_by: self.order_by.clone(),
            retention: Retention::from_max_retained(self.max_retained.filter(|&n| n > 0)),
            dedup_by_id: self.dedup_by_id,
        }
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

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            detections: default_detections_feed(),
            person_counts: default_person_counts_feed(),
            status: StatusConfig::default(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            table: default_status_table(),
        }
    }
}

impl Default for ResubscribeConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_resubscribe_initial_ms(),
            max_delay_ms: default_resubscribe_max_ms(),
        }
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_weather_base_url(),
            latitude: default_latitude(),
            longitude: default_longitude(),
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults_with_only_database_url() {
        let config = from_toml(
            r#"
            [database]
            url = "postgres://localhost/skywatch"
            "#,
        );

        assert_eq!(config.service.name, "skywatch-feed");
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.weather.poll_interval_secs, 300);
        assert_eq!(config.weather.latitude, 13.0735);
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.feeds.status.table, "system_status");
        assert_eq!(config.weather_poll_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_default_feed_retention() {
        let feeds = FeedsConfig::default();

        let detections = feeds.detections.settings("detections");
        assert_eq!(detections.retention, Retention::Bounded(50));
        assert_eq!(detections.order_by, "timestamp");
        assert!(detections.dedup_by_id);

        let person_counts = feeds.person_counts.settings("person_counts");
        assert_eq!(person_counts.retention, Retention::Unbounded);
        assert_eq!(person_counts.table, "person_count");
    }

    #[test]
    fn test_feed_overrides() {
        let config = from_toml(
            r#"
            [database]
            url = "postgres://localhost/skywatch"

            [feeds.detections]
            table = "intrusions"
            order_by = "seen_at"
            max_retained = 0
            dedup_by_id = false

            [feeds.person_counts]
            table = "person_count"
            order_by = "detected_at"
            max_retained = 200
            "#,
        );

        let detections = config.feeds.detections.settings("detections");
        assert_eq!(detections.table, "intrusions");
        assert_eq!(detections.retention, Retention::Unbounded);
        assert!(!detections.dedup_by_id);

        let person_counts = config.feeds.person_counts.settings("person_counts");
        assert_eq!(person_counts.retention, Retention::Bounded(200));
    }

    #[test]
    fn test_resubscribe_policy() {
        let config = from_toml(
            r#"
            [database]
            url = "postgres://localhost/skywatch"

            [resubscribe]
            initial_delay_ms = 250
            "#,
        );

        let policy = config.resubscribe_policy();
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = from_toml(
            r#"
            [database]
            url = "postgres://localhost/skywatch"
            "#,
        );

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_weather_interval_rejected() {
        let config = from_toml(
            r#"
            [database]
            url = "postgres://localhost/skywatch"

            [weather]
            poll_interval_secs = 0
            "#,
        );

        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("poll_interval_secs"));
    }

    #[test]
    fn test_zero_resubscribe_delay_rejected() {
        let config = from_toml(
            r#"
            [database]
            url = "postgres://localhost/skywatch"

            [resubscribe]
            initial_delay_ms = 0
            "#,
        );

        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("initial_delay_ms"));
    }

    #[test]
    fn test_max_delay_below_initial_rejected() {
        let config = from_toml(
            r#"
            [database]
            url = "postgres://localhost/skywatch"

            [resubscribe]
            initial_delay_ms = 5000
            max_delay_ms = 1000
            "#,
        );

        assert!(config.validate().is_err());
    }
}
