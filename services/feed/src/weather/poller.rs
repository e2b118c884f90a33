use super::{WeatherSource, WeatherView};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Fixed-interval weather poll.
///
/// Each poll is awaited before the next tick is taken, so requests never
/// overlap. A failed poll keeps the previously published view.
pub struct WeatherPoller {
    source: Arc<dyn WeatherSource>,
    interval: Duration,
    publisher: watch::Sender<WeatherView>,
}

impl WeatherPoller {
    pub fn new(
        source: Arc<dyn WeatherSource>,
        interval: Duration,
    ) -> (Self, watch::Receiver<WeatherView>) {
        let (publisher, receiver) = watch::channel(WeatherView::unavailable());
        (
            Self {
                source,
                interval,
                publisher,
            },
            receiver,
        )
    }

    /// Fetch once, publishing on success. Returns whether the view changed.
    pub async fn poll_once(&self) -> bool {
        match self.source.current().await {
            Ok(snapshot) => {
                metrics::counter!("weather.fetch.succeeded").increment(1);
                self.publisher
                    .send_replace(WeatherView::fetched(snapshot, Utc::now()));
                true
            }
            Err(e) => {
                error!(error = %e, "Weather fetch failed");
                metrics::counter!("weather.fetch.failed").increment(1);
                false
            }
        }
    }

    /// Poll immediately, then every `interval` until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs(),
            "Weather poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.poll_once() => {}
                    }
                }
            }
        }

        info!("Weather poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FeedError;
    use crate::weather::client::MockWeatherSource;
    use crate::weather::{ThreatLevel, WeatherSnapshot};
    use mockall::Sequence;

    fn calm() -> WeatherSnapshot {
        WeatherSnapshot::new(26.0, 2.0, Some(20000.0), 0, Some(0.0), Some(5.0))
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_previous_view() {
        let mut source = MockWeatherSource::new();
        let mut seq = Sequence::new();
        source
            .expect_current()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(calm()));
        source
            .expect_current()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(FeedError::WeatherFailure("timeout".to_string())));

        let (poller, view) = WeatherPoller::new(Arc::new(source), Duration::from_secs(300));
        assert_eq!(view.borrow().threat_level, ThreatLevel::High);

        assert!(poller.poll_once().await);
        let first = view.borrow().clone();
        assert_eq!(first.snapshot, Some(calm()));
        assert_eq!(first.threat_level, ThreatLevel::Low);

        assert!(!poller.poll_once().await);
        assert_eq!(*view.borrow(), first);
    }

    #[tokio::test]
    async fn test_failure_before_first_success_stays_unavailable() {
        let mut source = MockWeatherSource::new();
        source
            .expect_current()
            .returning(|| Err(FeedError::WeatherFailure("dns".to_string())));

        let (poller, view) = WeatherPoller::new(Arc::new(source), Duration::from_secs(300));
        assert!(!poller.poll_once().await);
        assert!(view.borrow().snapshot.is_none());
        assert_eq!(view.borrow().advisory.label, "Unsafe to Fly");
    }

    #[tokio::test]
    async fn test_run_polls_immediately_and_stops_on_cancel() {
        let mut source = MockWeatherSource::new();
        source.expect_current().returning(|| Ok(calm()));

        let (poller, mut view) = WeatherPoller::new(Arc::new(source), Duration::from_secs(300));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(poller.run(shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(5), view.wait_for(|v| v.snapshot.is_some()))
            .await
            .expect("first poll did not run")
            .unwrap();

        shutdown.cancel();
        task.await.unwrap();
    }
}
