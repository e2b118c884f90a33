use crate::error::FeedResult;
use crate::feed::FeedRecord;
use crate::time_format::{self, ist, LocalStamp};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Intrusion detection reported by the drone pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    /// Row id assigned by the datastore
    pub id: i64,
    /// Detection instant (UTC)
    pub timestamp: DateTime<Utc>,
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// IST display time and date derived from `timestamp`
    #[serde(flatten)]
    pub stamp: LocalStamp,
}

/// `detections` row as it arrives from the datastore
#[derive(Debug, Deserialize)]
struct DetectionRow {
    id: i64,
    timestamp: String,
    latitude: f64,
    longitude: f64,
}

impl FeedRecord for Detection {
    fn id(&self) -> i64 {
        self.id
    }

    fn instant(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn from_row(row: serde_json::Value) -> FeedResult<Self> {
        let row: DetectionRow = serde_json::from_value(row)?;
        let timestamp = time_format::parse_utc(&row.timestamp)?;

        Ok(Self {
            id: row.id,
            timestamp,
            latitude: row.latitude,
            longitude: row.longitude,
            stamp: time_format::format_instant(timestamp),
        })
    }
}

/// Person-count sample reported by the drone pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonDetection {
    pub id: i64,
    /// Persons observed in one sampling event
    pub person_count: u32,
    pub detected_at: DateTime<Utc>,
    #[serde(flatten)]
    pub stamp: LocalStamp,
}

#[derive(Debug, Deserialize)]
struct PersonDetectionRow {
    id: i64,
    person_count: u32,
    detected_at: String,
}

impl FeedRecord for PersonDetection {
    fn id(&self) -> i64 {
        self.id
    }

    fn instant(&self) -> DateTime<Utc> {
        self.detected_at
    }

    fn from_row(row: serde_json::Value) -> FeedResult<Self> {
        let row: PersonDetectionRow = serde_json::from_value(row)?;
        let detected_at = time_format::parse_utc(&row.detected_at)?;

        Ok(Self {
            id: row.id,
            person_count: row.person_count,
            detected_at,
            stamp: time_format::format_instant(detected_at),
        })
    }
}

/// Summary counters over the current detection snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectionStats {
    pub total: usize,
    /// Detections on the current IST calendar day
    pub today: usize,
    /// Detections within the last 60 minutes
    pub last_hour: usize,
}

impl DetectionStats {
    pub fn compute(detections: &[Detection], now: DateTime<Utc>) -> Self {
        let today = now.with_timezone(&ist()).date_naive();
        let hour_ago = now - Duration::hours(1);

        detections.iter().fold(
            Self {
                total: detections.len(),
                ..Default::default()
            },
            |mut stats, d| {
                if d.timestamp.with_timezone(&ist()).date_naive() == today {
                    stats.today += 1;
                }
                if d.timestamp > hour_ago {
                    stats.last_hour += 1;
                }
                stats
            },
        )
    }
}
