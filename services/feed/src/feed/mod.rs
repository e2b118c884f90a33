//! Feed reconciliation: locally held record lists kept consistent with a
//! remote table across an initial fetch and a live change stream.

pub mod store;
pub mod worker;

use crate::error::FeedResult;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use store::{Applied, FeedCommand, FeedSettings, FeedSnapshot, FeedState, FeedStore, Retention};
pub use worker::{spawn_mirror, Mirror, MirrorHandle, MirrorWorker, ResubscribePolicy};

/// A row type that can be mirrored by a [`FeedStore`].
pub trait FeedRecord: Clone + std::fmt::Debug + Serialize + Send + Sync + 'static {
    /// Unique id assigned by the datastore
    fn id(&self) -> i64;

    /// UTC instant that orders the feed
    fn instant(&self) -> DateTime<Utc>;

    /// Build a record from a raw JSON row, deriving its display fields.
    fn from_row(row: serde_json::Value) -> FeedResult<Self>;
}

/// Handle to a running feed worker
pub type FeedHandle<T> = MirrorHandle<FeedStore<T>>;
