//! Mirror of the single-row `system_status` table.

use crate::changes::RawChange;
use crate::datastore::TableQuery;
use crate::error::{FeedError, FeedResult};
use crate::feed::Mirror;
use crate::time_format;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tracing::{debug, info, warn};

/// Drone and monitoring flags reported by the pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub drone_active: bool,
    pub monitoring: bool,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SystemStatusRow {
    drone_active: bool,
    monitoring: bool,
    last_updated: String,
}

impl SystemStatus {
    /// Status shown before the first successful fetch
    pub fn offline(now: DateTime<Utc>) -> Self {
        Self {
            drone_active: false,
            monitoring: false,
            last_updated: now,
        }
    }

    pub fn from_row(row: serde_json::Value) -> FeedResult<Self> {
        let row: SystemStatusRow = serde_json::from_value(row)?;

        Ok(Self {
            drone_active: row.drone_active,
            monitoring: row.monitoring,
            last_updated: time_format::parse_utc(&row.last_updated)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub status: SystemStatus,
    /// A row has been read from the datastore
    pub ready: bool,
    pub stale: bool,
}

/// Single mutable status cell, replaced wholesale on every change
#[derive(Debug)]
pub struct StatusMirror {
    table: String,
    status: SystemStatus,
    ready: bool,
    stale: bool,
}

impl StatusMirror {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            status: SystemStatus::offline(Utc::now()),
            ready: false,
            stale: false,
        }
    }

    pub fn status(&self) -> &SystemStatus {
        &self.status
    }

    fn replace(&mut self, status: SystemStatus) {
        self.status = status;
        self.ready = true;
    }
}

impl Mirror for StatusMirror {
    type Snapshot = StatusSnapshot;
    type Command = Infallible;

    fn name(&self) -> &str {
        "status"
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn initial_query(&self) -> TableQuery {
        TableQuery::single_row(&self.table)
    }

    fn begin_loading(&mut self) {}

    fn load(&mut self, rows: Vec<serde_json::Value>) {
        let Some(row) = rows.into_iter().next() else {
            warn!(table = %self.table, "Status table is empty, keeping default");
            return;
        };

        match SystemStatus::from_row(row) {
            Ok(status) => {
                info!(
                    drone_active = status.drone_active,
                    monitoring = status.monitoring,
                    "Loaded system status"
                );
                self.replace(status);
                self.stale = false;
            }
            Err(e) => warn!(error = %e, "Ignoring unreadable status row"),
        }
    }

    fn on_change_event(&mut self, raw: RawChange) -> FeedResult<()> {
        raw.ensure_table(&self.table)?;

        // deletes carry no new row and cannot describe a status
        let row = raw.record.filter(|r| !r.is_null()).ok_or_else(|| {
            FeedError::MalformedEvent(format!("{:?} on {} without a new row", raw.operation, raw.table))
        })?;

        let status = SystemStatus::from_row(row)?;
        debug!(
            drone_active = status.drone_active,
            monitoring = status.monitoring,
            "System status replaced"
        );
        self.replace(status);

        Ok(())
    }

    fn handle_command(&mut self, command: Infallible) {
        match command {}
    }

    fn mark_stale(&mut self) {
        self.stale = true;
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status.clone(),
            ready: self.ready,
            stale: self.stale,
        }
    }
}
