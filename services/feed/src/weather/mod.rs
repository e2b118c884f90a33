//! Current weather at the monitored site and the flight advisory derived
//! from it.

pub mod classify;
pub mod client;
pub mod poller;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use classify::{
    advise, classify_threat, describe_weather_code, threat_for, weather_icon, AdvisoryVariant,
    FlightAdvisory, ThreatLevel,
};
pub use client::{OpenMeteoClient, WeatherSource};
pub use poller::WeatherPoller;

/// Coarse flying condition shown next to the raw metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SafetyRating {
    Good,
    Risky,
    Dangerous,
}

impl From<ThreatLevel> for SafetyRating {
    fn from(level: ThreatLevel) -> Self {
        match level {
            ThreatLevel::Low => SafetyRating::Good,
            ThreatLevel::Moderate => SafetyRating::Risky,
            ThreatLevel::High => SafetyRating::Dangerous,
        }
    }
}

/// Latest observation for the configured coordinates
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherSnapshot {
    /// Air temperature, °C
    pub temp: f64,
    /// Wind speed, m/s
    pub wind_speed: f64,
    /// Visibility in meters, when the provider reports it
    pub visibility: Option<f64>,
    /// WMO weather code
    pub condition: String,
    pub description: String,
    /// Precipitation, mm
    pub rain: Option<f64>,
    /// Cloud cover, %
    pub clouds: Option<f64>,
    pub safe: SafetyRating,
}

impl WeatherSnapshot {
    pub fn new(
        temp: f64,
        wind_speed: f64,
        visibility: Option<f64>,
        code: i64,
        rain: Option<f64>,
        clouds: Option<f64>,
    ) -> Self {
        Self {
            temp,
            wind_speed,
            visibility,
            condition: code.to_string(),
            description: describe_weather_code(code).to_string(),
            rain,
            clouds,
            safe: threat_for(wind_speed, visibility).into(),
        }
    }
}

/// What the dashboard shows for weather
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherView {
    pub snapshot: Option<WeatherSnapshot>,
    pub threat_level: ThreatLevel,
    pub advisory: FlightAdvisory,
    pub icon: &'static str,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl WeatherView {
    /// View before any successful poll
    pub fn unavailable() -> Self {
        Self::build(None, None)
    }

    pub fn fetched(snapshot: WeatherSnapshot, at: DateTime<Utc>) -> Self {
        Self::build(Some(snapshot), Some(at))
    }

    fn build(snapshot: Option<WeatherSnapshot>, fetched_at: Option<DateTime<Utc>>) -> Self {
        let threat_level = classify_threat(snapshot.as_ref());
        let icon = snapshot
            .as_ref()
            .and_then(|s| s.condition.parse::<i64>().ok())
            .map_or(weather_icon(0), weather_icon);

        Self {
            snapshot,
            threat_level,
            advisory: advise(threat_level),
            icon,
            fetched_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_view_is_unsafe() {
        let view = WeatherView::unavailable();
        assert!(view.snapshot.is_none());
        assert_eq!(view.threat_level, ThreatLevel::High);
        assert_eq!(view.advisory.label, "Unsafe to Fly");
    }

    #[test]
    fn test_snapshot_safe_tracks_threat_level() {
        let calm = WeatherSnapshot::new(27.0, 2.0, Some(24140.0), 1, Some(0.0), Some(12.0));
        assert_eq!(calm.safe, SafetyRating::Good);
        assert_eq!(calm.description, "Mainly Clear");

        let breezy = WeatherSnapshot::new(27.0, 6.0, None, 3, None, None);
        assert_eq!(breezy.safe, SafetyRating::Risky);

        let foggy = WeatherSnapshot::new(18.0, 1.0, Some(800.0), 45, None, Some(100.0));
        assert_eq!(foggy.safe, SafetyRating::Dangerous);

        let view = WeatherView::fetched(foggy, Utc::now());
        assert_eq!(view.threat_level, ThreatLevel::High);
        assert_eq!(view.icon, weather_icon(45));
    }

    #[test]
    fn test_snapshot_serialized_shape() {
        let snapshot = WeatherSnapshot::new(30.5, 3.2, Some(10000.0), 2, Some(0.1), Some(40.0));
        let value = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(value["windSpeed"], 3.2);
        assert_eq!(value["condition"], "2");
        assert_eq!(value["safe"], "Good");
    }
}
