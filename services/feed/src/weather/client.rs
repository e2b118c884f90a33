use super::WeatherSnapshot;
use crate::config::WeatherConfig;
use crate::error::{FeedError, FeedResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

/// Provider of current weather for a fixed location
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn current(&self) -> FeedResult<WeatherSnapshot>;
}

/// Open-Meteo forecast API client
pub struct OpenMeteoClient {
    client: reqwest::Client,
    base_url: String,
    latitude: f64,
    longitude: f64,
}

impl OpenMeteoClient {
    pub fn new(config: &WeatherConfig) -> FeedResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| FeedError::WeatherFailure(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            latitude: config.latitude,
            longitude: config.longitude,
        })
    }

    fn forecast_url(&self) -> String {
        format!("{}/v1/forecast", self.base_url)
    }
}

#[async_trait]
impl WeatherSource for OpenMeteoClient {
    #[instrument(skip(self), fields(latitude = self.latitude, longitude = self.longitude))]
    async fn current(&self) -> FeedResult<WeatherSnapshot> {
        let response = self
            .client
            .get(self.forecast_url())
            .query(&[
                ("latitude", self.latitude.to_string()),
                ("longitude", self.longitude.to_string()),
                ("current_weather", "true".to_string()),
                ("hourly", "visibility,precipitation,cloudcover".to_string()),
                ("windspeed_unit", "ms".to_string()),
            ])
            .send()
            .await
            .map_err(|e| FeedError::WeatherFailure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::WeatherFailure(format!(
                "provider returned {status}: {body}"
            )));
        }

        let forecast: ForecastResponse = response
            .json()
            .await
            .map_err(|e| FeedError::WeatherFailure(format!("undecodable forecast: {e}")))?;

        let snapshot = forecast.into_snapshot();
        debug!(
            temp = snapshot.temp,
            wind_speed = snapshot.wind_speed,
            condition = %snapshot.condition,
            "Fetched current weather"
        );

        Ok(snapshot)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ForecastResponse {
    current_weather: CurrentWeather,
    #[serde(default)]
    hourly: Option<Hourly>,
}

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    temperature: f64,
    windspeed: f64,
    weathercode: i64,
    #[serde(default)]
    time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Hourly {
    #[serde(default)]
    time: Vec<String>,
    #[serde(default)]
    visibility: Vec<Option<f64>>,
    #[serde(default)]
    precipitation: Vec<Option<f64>>,
    #[serde(default)]
    cloudcover: Vec<Option<f64>>,
}

impl Hourly {
    /// Slot of the hour containing `current`, or the first slot.
    fn index_for(&self, current: Option<&str>) -> usize {
        let hour = |t: &str| t.get(..13).map(str::to_owned);

        current
            .and_then(hour)
            .and_then(|wanted| {
                self.time
                    .iter()
                    .position(|t| hour(t).as_deref() == Some(wanted.as_str()))
            })
            .unwrap_or(0)
    }
}

fn value_at(series: &[Option<f64>], index: usize) -> Option<f64> {
    series.get(index).copied().flatten()
}

impl ForecastResponse {
    pub(crate) fn into_snapshot(self) -> WeatherSnapshot {
        let current = self.current_weather;
        let hourly = self.hourly.unwrap_or_default();
        let index = hourly.index_for(current.time.as_deref());

        WeatherSnapshot::new(
            current.temperature,
            current.windspeed,
            value_at(&hourly.visibility, index),
            current.weathercode,
            value_at(&hourly.precipitation, index),
            value_at(&hourly.cloudcover, index),
        )
    }
}
