use crate::datastore::unqualified;
use crate::error::{FeedError, FeedResult};
use crate::feed::FeedRecord;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Row operation reported by the change-notification channel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// Change notification as emitted by the datastore trigger, before validation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawChange {
    /// Table the row belongs to
    pub table: String,
    /// Operation that produced the notification
    #[serde(rename = "type")]
    pub operation: ChangeOperation,
    /// Row after the change (absent for deletes)
    #[serde(default)]
    pub record: Option<serde_json::Value>,
    /// Row before the change (absent for inserts)
    #[serde(default)]
    pub old_record: Option<serde_json::Value>,
}

impl RawChange {
    /// Decode a notification payload.
    pub fn from_payload(payload: &str) -> FeedResult<Self> {
        let raw: RawChange = serde_json::from_str(payload)
            .map_err(|e| FeedError::MalformedEvent(format!("undecodable payload: {e}")))?;

        trace!(table = %raw.table, operation = ?raw.operation, "Decoded change payload");

        Ok(raw)
    }

    /// Reject notifications that belong to another table. The trigger reports
    /// bare table names, so a schema on `expected` is ignored.
    pub fn ensure_table(&self, expected: &str) -> FeedResult<()> {
        if unqualified(&self.table) == unqualified(expected) {
            Ok(())
        } else {
            Err(FeedError::MalformedEvent(format!(
                "event for table {:?} delivered to {:?} subscription",
                self.table, expected
            )))
        }
    }

    fn take_record(&mut self) -> FeedResult<serde_json::Value> {
        take_row(&mut self.record, "record", self.operation)
    }

    fn take_old_record(&mut self) -> FeedResult<serde_json::Value> {
        take_row(&mut self.old_record, "old_record", self.operation)
    }
}

fn take_row(
    slot: &mut Option<serde_json::Value>,
    field: &str,
    operation: ChangeOperation,
) -> FeedResult<serde_json::Value> {
    match slot.take() {
        Some(serde_json::Value::Null) | None => Err(FeedError::MalformedEvent(format!(
            "{operation:?} event is missing {field}"
        ))),
        Some(row) => Ok(row),
    }
}

/// Validated change for a feed of `T`
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<T> {
    Insert(T),
    /// Previous row, then current row
    Update(T, T),
    Delete(T),
}

impl<T: FeedRecord> ChangeEvent<T> {
    /// Convert a raw notification into a typed event.
    ///
    /// Rows go through [`FeedRecord::from_row`], so timestamps are parsed and
    /// formatted here. Any missing or ill-shaped row rejects the whole event.
    pub fn from_raw(mut raw: RawChange) -> FeedResult<Self> {
        match raw.operation {
            ChangeOperation::Insert => Ok(ChangeEvent::Insert(T::from_row(raw.take_record()?)?)),
            ChangeOperation::Update => {
                let new = T::from_row(raw.take_record()?)?;
                let old = T::from_row(raw.take_old_record()?)?;
                Ok(ChangeEvent::Update(old, new))
            }
            ChangeOperation::Delete => Ok(ChangeEvent::Delete(T::from_row(raw.take_old_record()?)?)),
        }
    }

    pub fn operation(&self) -> ChangeOperation {
        match self {
            ChangeEvent::Insert(_) => ChangeOperation::Insert,
            ChangeEvent::Update(..) => ChangeOperation::Update,
            ChangeEvent::Delete(_) => ChangeOperation::Delete,
        }
    }

    /// Id of the affected row
    pub fn id(&self) -> i64 {
        match self {
            ChangeEvent::Insert(row) | ChangeEvent::Update(_, row) | ChangeEvent::Delete(row) => {
                row.id()
            }
        }
    }
}
