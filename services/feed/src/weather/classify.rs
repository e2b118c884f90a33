use super::WeatherSnapshot;
use serde::Serialize;

/// Visibility assumed when the provider reports none, meters
pub const DEFAULT_VISIBILITY_M: f64 = 10_000.0;

const HIGH_WIND_KMH: f64 = 35.0;
const MODERATE_WIND_KMH: f64 = 18.0;
const HIGH_VISIBILITY_M: f64 = 2_000.0;
const MODERATE_VISIBILITY_M: f64 = 5_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatLevel {
    Low,
    Moderate,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvisoryVariant {
    Success,
    Warning,
    Destructive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlightAdvisory {
    pub label: &'static str,
    pub variant: AdvisoryVariant,
}

/// Threat level for the current snapshot. No data is treated as `High`.
pub fn classify_threat(snapshot: Option<&WeatherSnapshot>) -> ThreatLevel {
    match snapshot {
        Some(s) => threat_for(s.wind_speed, s.visibility),
        None => ThreatLevel::High,
    }
}

/// Threat level from wind speed (m/s) and visibility (m).
///
/// Thresholds are strict, a value sitting exactly on one stays in the lower band.
pub fn threat_for(wind_speed: f64, visibility: Option<f64>) -> ThreatLevel {
    let wind_kmh = wind_speed * 3.6;
    let visibility = visibility.unwrap_or(DEFAULT_VISIBILITY_M);

    if wind_kmh > HIGH_WIND_KMH || visibility < HIGH_VISIBILITY_M {
        ThreatLevel::High
    } else if wind_kmh > MODERATE_WIND_KMH || visibility < MODERATE_VISIBILITY_M {
        ThreatLevel::Moderate
    } else {
        ThreatLevel::Low
    }
}

pub fn advise(level: ThreatLevel) -> FlightAdvisory {
    match level {
        ThreatLevel::Low => FlightAdvisory {
            label: "Good to Fly",
            variant: AdvisoryVariant::Success,
        },
        ThreatLevel::Moderate => FlightAdvisory {
            label: "Caution — Assess",
            variant: AdvisoryVariant::Warning,
        },
        ThreatLevel::High => FlightAdvisory {
            label: "Unsafe to Fly",
            variant: AdvisoryVariant::Destructive,
        },
    }
}

/// Human label for a WMO weather interpretation code
pub fn describe_weather_code(code: i64) -> &'static str {
    match code {
        0 => "Clear",
        1 => "Mainly Clear",
        2 => "Partly Cloudy",
        3 => "Overcast",
        45 => "Fog",
        48 => "Rime Fog",
        51 => "Light Drizzle",
        53 => "Moderate Drizzle",
        55 => "Dense Drizzle",
        56 => "Freezing Drizzle Light",
        57 => "Freezing Drizzle Dense",
        61 => "Rain Slight",
        63 => "Rain Moderate",
        65 => "Rain Heavy",
        66 => "Freezing Rain Light",
        67 => "Freezing Rain Heavy",
        71 => "Snow Slight",
        73 => "Snow Moderate",
        75 => "Snow Heavy",
        77 => "Snow Grains",
        80 => "Rain Showers Slight",
        81 => "Rain Showers Moderate",
        82 => "Rain Showers Violent",
        85 => "Snow Showers Slight",
        86 => "Snow Showers Heavy",
        95 => "Thunderstorm",
        96 => "Thunderstorm Slight Hail",
        99 => "Thunderstorm Heavy Hail",
        _ => "Unknown",
    }
}

/// Display glyph for a WMO code; unknown codes show as clear
pub fn weather_icon(code: i64) -> &'static str {
    match code {
        2 | 3 => "⛅",
        45 | 48 => "🌫️",
        51 | 53 | 55 | 61 | 63 | 65 | 80 | 81 | 82 => "🌧️",
        71 | 73 | 75 | 85 | 86 => "❄️",
        95 | 96 | 99 => "⛈️",
        _ => "☀️",
    }
}
