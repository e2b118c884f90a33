use super::worker::{Mirror, MirrorHandle};
use super::FeedRecord;
use crate::changes::{ChangeEvent, RawChange};
use crate::datastore::TableQuery;
use crate::error::FeedResult;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on the initial read of a bounded feed
pub const INITIAL_FETCH_CAP: usize = 50;

/// How many records a feed keeps locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Keep the newest `N`, silently discarding the rest
    Bounded(usize),
    Unbounded,
}

impl Retention {
    pub fn from_max_retained(max_retained: Option<usize>) -> Self {
        max_retained.map_or(Retention::Unbounded, Retention::Bounded)
    }

    /// Row limit for the initial fetch: `min(N, 50)`, or everything.
    pub fn initial_fetch_limit(&self) -> Option<i64> {
        match self {
            Retention::Bounded(n) => Some((*n).min(INITIAL_FETCH_CAP) as i64),
            Retention::Unbounded => None,
        }
    }

    fn truncate<T>(&self, records: &mut Vec<T>) {
        if let Retention::Bounded(n) = self {
            records.truncate(*n);
        }
    }
}

/// Lifecycle of a feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Uninitialized,
    Loading,
    Live,
}

/// Outcome of a single mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    /// A record with the same id was replaced
    Replaced,
    Removed,
    /// Older than everything held by a full bounded feed
    Discarded,
    /// Nothing matched
    Unchanged,
}

impl Applied {
    fn from_parts(placed: bool, removed: bool) -> Self {
        match (placed, removed) {
            (true, true) => Applied::Replaced,
            (true, false) => Applied::Inserted,
            (false, true) => Applied::Removed,
            (false, false) => Applied::Discarded,
        }
    }
}

/// Read-only view handed to consumers, newest record first.
///
/// Records are shared, so cloning a snapshot does not copy them.
#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot<T> {
    pub records: Arc<[T]>,
    pub state: FeedState,
    pub ready: bool,
    pub stale: bool,
}

impl<T> Default for FeedSnapshot<T> {
    fn default() -> Self {
        Self {
            records: Arc::from(Vec::new()),
            state: FeedState::Uninitialized,
            ready: false,
            stale: false,
        }
    }
}

/// Per-feed configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSettings {
    /// Name used in logs and metrics
    pub name: String,
    /// Backing table
    pub table: String,
    /// Instant column the initial fetch orders by
    pub order_by: String,
    pub retention: Retention,
    /// Treat a repeated insert of a held id as an update
    pub dedup_by_id: bool,
}

/// Local commands serialized with change events
#[derive(Debug, Clone)]
pub enum FeedCommand<T> {
    /// Optimistic insert of a record not yet confirmed by the datastore
    AddLocal(T),
}

/// In-memory mirror of one remote table.
///
/// Records are kept ordered by `(instant, id)` descending. Every mutation
/// places the record at its ordered position and then applies the retention
/// policy, so the list never holds more than `N` records and never goes out
/// of order, whatever order the channel delivers in.
#[derive(Debug)]
pub struct FeedStore<T> {
    settings: FeedSettings,
    state: FeedState,
    stale: bool,
    records: Vec<T>,
}

impl<T: FeedRecord> FeedStore<T> {
    pub fn new(settings: FeedSettings) -> Self {
        Self {
            settings,
            state: FeedState::Uninitialized,
            stale: false,
            records: Vec::new(),
        }
    }

    pub fn settings(&self) -> &FeedSettings {
        &self.settings
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == FeedState::Live
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }

    pub fn latest(&self) -> Option<&T> {
        self.records.first()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn begin_loading(&mut self) {
        if self.state == FeedState::Uninitialized {
            self.state = FeedState::Loading;
        }
    }

    /// Replace the whole list with the result of a bulk read.
    pub fn replace_all(&mut self, mut records: Vec<T>) {
        records.sort_by(newer_first);

        if self.settings.dedup_by_id {
            let mut seen = HashSet::with_capacity(records.len());
            records.retain(|r| seen.insert(r.id()));
        }

        self.settings.retention.truncate(&mut records);
        self.records = records;
        self.state = FeedState::Live;
        self.stale = false;
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Apply a validated change event.
    pub fn apply(&mut self, event: ChangeEvent<T>) -> Applied {
        match event {
            ChangeEvent::Insert(record) => self.insert(record),
            ChangeEvent::Update(old, new) => {
                let mut removed = self.remove_id(old.id());
                if new.id() != old.id() {
                    removed |= self.remove_id(new.id());
                }
                let placed = self.place(new);
                Applied::from_parts(placed, removed)
            }
            ChangeEvent::Delete(old) => {
                if self.remove_id(old.id()) {
                    Applied::Removed
                } else {
                    Applied::Unchanged
                }
            }
        }
    }

    /// Optimistic local insert, same placement and truncation as a remote insert.
    pub fn add_local(&mut self, record: T) -> Applied {
        self.insert(record)
    }

    pub fn snapshot(&self) -> FeedSnapshot<T> {
        FeedSnapshot {
            records: Arc::from(self.records.as_slice()),
            state: self.state,
            ready: self.is_ready(),
            stale: self.stale,
        }
    }

    fn insert(&mut self, record: T) -> Applied {
        let removed = self.settings.dedup_by_id && self.remove_id(record.id());
        let placed = self.place(record);
        Applied::from_parts(placed, removed)
    }

    /// Returns false when the record falls outside a full bounded feed.
    fn place(&mut self, record: T) -> bool {
        let pos = self
            .records
            .partition_point(|held| newer_first(held, &record) == Ordering::Less);

        if let Retention::Bounded(n) = self.settings.retention {
            if pos >= n {
                return false;
            }
        }

        self.records.insert(pos, record);
        self.settings.retention.truncate(&mut self.records);
        true
    }

    fn remove_id(&mut self, id: i64) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.id() != id);
        self.records.len() != before
    }
}

/// Newest first; ties on the instant broken by the larger id.
fn newer_first<T: FeedRecord>(a: &T, b: &T) -> Ordering {
    (b.instant(), b.id()).cmp(&(a.instant(), a.id()))
}

impl<T: FeedRecord> Mirror for FeedStore<T> {
    type Snapshot = FeedSnapshot<T>;
    type Command = FeedCommand<T>;

    fn name(&self) -> &str {
        &self.settings.name
    }

    fn table(&self) -> &str {
        &self.settings.table
    }

    fn initial_query(&self) -> TableQuery {
        TableQuery::newest_first(
            &self.settings.table,
            &self.settings.order_by,
            self.settings.retention.initial_fetch_limit(),
        )
    }

    fn begin_loading(&mut self) {
        FeedStore::begin_loading(self);
    }

    fn load(&mut self, rows: Vec<serde_json::Value>) {
        let fetched = rows.len();
        let records: Vec<T> = rows
            .into_iter()
            .filter_map(|row| match T::from_row(row) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(feed = %self.settings.name, error = %e, "Dropping fetched row");
                    metrics::counter!("feed.rows.dropped", "feed" => self.settings.name.clone())
                        .increment(1);
                    None
                }
            })
            .collect();

        self.replace_all(records);

        info!(
            feed = %self.settings.name,
            fetched = fetched,
            retained = self.records.len(),
            "Feed is live"
        );
    }

    fn on_change_event(&mut self, raw: RawChange) -> FeedResult<()> {
        raw.ensure_table(&self.settings.table)?;
        let event = ChangeEvent::<T>::from_raw(raw)?;
        let operation = event.operation();
        let id = event.id();
        let applied = self.apply(event);

        debug!(
            feed = %self.settings.name,
            operation = ?operation,
            id = id,
            applied = ?applied,
            retained = self.records.len(),
            "Applied change event"
        );

        Ok(())
    }

    fn handle_command(&mut self, command: FeedCommand<T>) {
        match command {
            FeedCommand::AddLocal(record) => {
                let id = record.id();
                let applied = self.add_local(record);
                debug!(feed = %self.settings.name, id = id, applied = ?applied, "Added local record");
            }
        }
    }

    fn mark_stale(&mut self) {
        FeedStore::mark_stale(self);
    }

    fn snapshot(&self) -> FeedSnapshot<T> {
        FeedStore::snapshot(self)
    }
}

impl<T: FeedRecord> MirrorHandle<FeedStore<T>> {
    /// Optimistically insert a record ahead of its change notification.
    pub async fn add_local(&self, record: T) -> FeedResult<()> {
        self.send(FeedCommand::AddLocal(record)).await
    }
}
