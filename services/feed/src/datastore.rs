use crate::changes::RawChange;
use crate::config::DatabaseConfig;
use crate::error::{FeedError, FeedResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use sqlx::postgres::{PgListener, PgNotification, PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Channel prefix used by the `skywatch_notify_change` trigger
pub const NOTIFY_CHANNEL_PREFIX: &str = "skywatch_";

/// Live change notifications for one table.
///
/// A `MalformedEvent` item affects only that notification; a
/// `SubscriptionFailure` item means the channel dropped.
pub type ChangeStream = BoxStream<'static, FeedResult<RawChange>>;

/// Bulk read of a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableQuery {
    pub table: String,
    /// Column to order by
    pub order_by: Option<String>,
    /// Order descending (newest first)
    pub descending: bool,
    /// Maximum number of rows
    pub limit: Option<i64>,
}

impl TableQuery {
    pub fn newest_first(table: &str, order_by: &str, limit: Option<i64>) -> Self {
        Self {
            table: table.to_string(),
            order_by: Some(order_by.to_string()),
            descending: true,
            limit,
        }
    }

    pub fn single_row(table: &str) -> Self {
        Self {
            table: table.to_string(),
            order_by: None,
            descending: false,
            limit: Some(1),
        }
    }

    /// Render the query, each row as one JSON object. The limit is bound as `$1`.
    pub fn to_sql(&self) -> FeedResult<String> {
        let mut sql = format!("SELECT row_to_json(t) FROM {} t", quote_ident(&self.table)?);

        if let Some(ref column) = self.order_by {
            sql.push_str(&format!(
                " ORDER BY t.{} {}",
                quote_ident(column)?,
                if self.descending { "DESC" } else { "ASC" }
            ));
        }

        if self.limit.is_some() {
            sql.push_str(" LIMIT $1");
        }

        Ok(sql)
    }
}

/// Table name without its schema, as the trigger reports it in `TG_TABLE_NAME`
pub fn unqualified(table: &str) -> &str {
    table.rsplit_once('.').map_or(table, |(_, name)| name)
}

/// Quote a plain or schema-qualified identifier, rejecting anything else.
pub fn quote_ident(name: &str) -> FeedResult<String> {
    let parts: Vec<&str> = name.split('.').collect();

    let valid = parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if !valid {
        return Err(FeedError::InvalidIdentifier(name.to_string()));
    }

    Ok(parts
        .iter()
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join("."))
}

/// Remote datastore the feeds mirror
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Read rows from a table
    async fn select(&self, query: &TableQuery) -> FeedResult<Vec<serde_json::Value>>;

    /// Subscribe to insert/update/delete notifications for a table
    async fn subscribe(&self, table: &str) -> FeedResult<ChangeStream>;
}

/// Postgres-backed datastore: pooled queries plus `LISTEN/NOTIFY`
pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    /// Create a new datastore with connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Install the change-notification triggers
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Channel the trigger notifies on; it only knows the unqualified name.
    pub fn channel_for(table: &str) -> String {
        format!("{NOTIFY_CHANNEL_PREFIX}{}", unqualified(table))
    }
}

/// Turn one listener receive into a change.
///
/// `Ok(None)` is a lost connection. The listener would reconnect on the next
/// receive, but anything notified in between is gone, so it surfaces as a
/// `SubscriptionFailure` and the caller refetches.
fn to_change<E: Display>(table: &str, received: Result<Option<&str>, E>) -> FeedResult<RawChange> {
    match received {
        Ok(Some(payload)) => RawChange::from_payload(payload),
        Ok(None) => Err(FeedError::subscription(
            table,
            "connection lost, notifications may have been missed",
        )),
        Err(e) => Err(FeedError::subscription(table, e)),
    }
}

#[async_trait]
impl Datastore for PgDatastore {
    #[instrument(skip(self, query), fields(table = %query.table, limit = ?query.limit))]
    async fn select(&self, query: &TableQuery) -> FeedResult<Vec<serde_json::Value>> {
        let sql = query.to_sql()?;

        let mut statement = sqlx::query_scalar::<_, Json<serde_json::Value>>(&sql);
        if let Some(limit) = query.limit {
            statement = statement.bind(limit);
        }

        let rows = statement
            .fetch_all(&self.pool)
            .await
            .map_err(|e| FeedError::fetch(&query.table, e))?;

        debug!(rows = rows.len(), "Fetched rows");

        Ok(rows.into_iter().map(|Json(row)| row).collect())
    }

    #[instrument(skip(self))]
    async fn subscribe(&self, table: &str) -> FeedResult<ChangeStream> {
        let channel = Self::channel_for(table);

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| FeedError::subscription(table, e))?;

        listener
            .listen(&channel)
            .await
            .map_err(|e| FeedError::subscription(table, e))?;

        info!(table = %table, channel = %channel, "Listening for change notifications");

        let table = table.to_string();
        let stream = stream::unfold(Some(listener), move |listener| {
            let table = table.clone();
            async move {
                let mut listener = listener?;
                let received = listener.try_recv().await;
                let change = to_change(
                    &table,
                    received.as_ref().map(|n| n.as_ref().map(PgNotification::payload)),
                );

                // end the stream after a failure instead of re-listening silently
                let listener = match change {
                    Err(FeedError::SubscriptionFailure { .. }) => {
                        warn!(table = %table, "Notification listener lost its connection");
                        None
                    }
                    _ => Some(listener),
                };

                Some((change, listener))
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_first_query() {
        let query = TableQuery::newest_first("detections", "timestamp", Some(50));
        assert_eq!(
            query.to_sql().unwrap(),
            r#"SELECT row_to_json(t) FROM "detections" t ORDER BY t."timestamp" DESC LIMIT $1"#
        );
    }

    #[test]
    fn test_unbounded_query_has_no_limit() {
        let query = TableQuery::newest_first("public.person_count", "detected_at", None);
        assert_eq!(
            query.to_sql().unwrap(),
            r#"SELECT row_to_json(t) FROM "public"."person_count" t ORDER BY t."detected_at" DESC"#
        );
    }

    #[test]
    fn test_single_row_query() {
        assert_eq!(
            TableQuery::single_row("system_status").to_sql().unwrap(),
            r#"SELECT row_to_json(t) FROM "system_status" t LIMIT $1"#
        );
    }

    #[test]
    fn test_rejects_unsafe_identifiers() {
        for name in ["", "detections; DROP TABLE x", "a.b.c", "1table", "tab\"le", "weird-name"] {
            assert!(
                matches!(quote_ident(name), Err(FeedError::InvalidIdentifier(_))),
                "{name:?} should be rejected"
            );
        }

        let query = TableQuery::newest_first("detections", "time stamp", None);
        assert!(query.to_sql().is_err());
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(PgDatastore::channel_for("detections"), "skywatch_detections");
    }

    #[test]
    fn test_channel_name_ignores_schema() {
        assert_eq!(PgDatastore::channel_for("public.detections"), "skywatch_detections");
        assert_eq!(unqualified("public.person_count"), "person_count");
        assert_eq!(unqualified("system_status"), "system_status");
    }

    #[test]
    fn test_notification_payload_becomes_change() {
        let payload = r#"{"table":"detections","type":"INSERT","record":{"id":1},"old_record":null}"#;

        let change = to_change::<sqlx::Error>("detections", Ok(Some(payload))).unwrap();
        assert_eq!(change.table, "detections");
        assert!(change.record.is_some());

        assert!(matches!(
            to_change::<sqlx::Error>("detections", Ok(Some("not json"))),
            Err(FeedError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_lost_connection_is_subscription_failure() {
        let result = to_change::<sqlx::Error>("detections", Ok(None));
        assert!(matches!(
            result,
            Err(FeedError::SubscriptionFailure { ref table, .. }) if table == "detections"
        ));

        let result = to_change("detections", Err(sqlx::Error::PoolClosed));
        assert!(matches!(result, Err(FeedError::SubscriptionFailure { .. })));
    }
}
