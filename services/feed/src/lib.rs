//! Skywatch Feed Service
//!
//! Reconciliation core for the drone monitoring dashboard. The service mirrors
//! rows written by the detection pipeline into local, read-only snapshots: an
//! initial bulk fetch per table followed by a live stream of insert, update and
//! delete notifications. Timestamps are normalized to IST for display and the
//! current weather is classified into a flight advisory.
//!
//! ## Features
//!
//! - **Ordered Feeds**: detections and person counts held newest first, with a
//!   configurable bound on retained history
//! - **Change Notifications**: Postgres `LISTEN/NOTIFY` triggers, validated into
//!   typed change events before they touch a feed
//! - **Status Mirror**: single-row drone/monitoring status
//! - **Weather Advisory**: Open-Meteo polling with a fixed threat classification
//! - **Dashboard API**: JSON endpoints serving the current snapshots
//!
//! ## Architecture
//!
//! ```text
//! PostgreSQL                     Feed Workers                 Dashboard API
//! ┌──────────────┐  NOTIFY      ┌──────────────┐  watch      ┌──────────────┐
//! │ detections   │─────────────▶│ FeedStore    │────────────▶│ /detections  │
//! │ person_count │─────────────▶│ FeedStore    │────────────▶│ /person-...  │
//! │ system_status│─────────────▶│ StatusMirror │────────────▶│ /status      │
//! └──────────────┘  SELECT      └──────────────┘             │              │
//!                                                            │              │
//! Open-Meteo         ┌──────────────┐       watch            │              │
//! ┌──────────────┐   │ Weather      │───────────────────────▶│ /weather     │
//! │ /v1/forecast │──▶│ Poller       │                        └──────────────┘
//! └──────────────┘   └──────────────┘
//! ```

pub mod api;
pub mod changes;
pub mod config;
pub mod datastore;
pub mod error;
pub mod feed;
pub mod records;
pub mod status;
pub mod time_format;
pub mod weather;

pub use changes::{ChangeEvent, ChangeOperation, RawChange};
pub use config::Config;
pub use datastore::{Datastore, PgDatastore, TableQuery};
pub use error::{FeedError, FeedResult};
pub use feed::{FeedHandle, FeedRecord, FeedSnapshot, FeedState, FeedStore, Retention};
pub use records::{Detection, DetectionStats, PersonDetection};
pub use status::{StatusMirror, SystemStatus};
pub use time_format::LocalStamp;
pub use weather::{ThreatLevel, WeatherSnapshot, WeatherView};
