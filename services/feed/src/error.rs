use thiserror::Error;

/// Errors raised while mirroring remote feeds.
///
/// Every variant is local to one feed: the owning worker logs it and carries
/// on, sibling feeds are never affected.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Initial fetch from {table} failed: {message}")]
    FetchFailure { table: String, message: String },

    #[error("Subscription to {table} failed: {message}")]
    SubscriptionFailure { table: String, message: String },

    #[error("Malformed change event: {0}")]
    MalformedEvent(String),

    #[error("Invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    #[error("Weather fetch failed: {0}")]
    WeatherFailure(String),

    #[error("Invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Feed {0} is no longer running")]
    Closed(String),
}

impl FeedError {
    pub fn fetch(table: &str, err: impl std::fmt::Display) -> Self {
        FeedError::FetchFailure {
            table: table.to_string(),
            message: err.to_string(),
        }
    }

    pub fn subscription(table: &str, err: impl std::fmt::Display) -> Self {
        FeedError::SubscriptionFailure {
            table: table.to_string(),
            message: err.to_string(),
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedError::FetchFailure { .. } => "fetch_failure",
            FeedError::SubscriptionFailure { .. } => "subscription_failure",
            FeedError::MalformedEvent(_) => "malformed_event",
            FeedError::InvalidTimestamp(_) => "invalid_timestamp",
            FeedError::WeatherFailure(_) => "weather_failure",
            FeedError::InvalidIdentifier(_) => "invalid_identifier",
            FeedError::Closed(_) => "closed",
        }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::MalformedEvent(err.to_string())
    }
}

pub type FeedResult<T> = std::result::Result<T, FeedError>;
