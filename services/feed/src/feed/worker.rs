//! Task that owns one mirror and serializes every mutation of it.
//!
//! The initial fetch, change notifications and local commands all pass through
//! a single `select!` loop, so a mirror is never mutated concurrently. Readers
//! only ever see whole snapshots published on a `watch` channel.

use crate::changes::RawChange;
use crate::datastore::{ChangeStream, Datastore, TableQuery};
use crate::error::{FeedError, FeedResult};
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

const COMMAND_BUFFER: usize = 64;

/// Local state mirrored from one remote table
pub trait Mirror: Send + Sync + 'static {
    type Snapshot: Clone + Send + Sync + 'static;
    type Command: Send + 'static;

    fn name(&self) -> &str;

    /// Table whose change notifications drive this mirror
    fn table(&self) -> &str;

    /// Bulk read issued on start and after every resubscribe
    fn initial_query(&self) -> TableQuery;

    fn begin_loading(&mut self);

    /// Replace local state with the rows of a successful bulk read.
    fn load(&mut self, rows: Vec<serde_json::Value>);

    /// Validate and apply one notification. Errors leave the state untouched.
    fn on_change_event(&mut self, raw: RawChange) -> FeedResult<()>;

    fn handle_command(&mut self, command: Self::Command);

    fn mark_stale(&mut self);

    fn snapshot(&self) -> Self::Snapshot;
}

/// Delay bounds for re-establishing a dropped subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResubscribePolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ResubscribePolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ResubscribePolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_delay,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Read access to a running mirror plus its command queue
pub struct MirrorHandle<M: Mirror> {
    name: String,
    snapshots: watch::Receiver<M::Snapshot>,
    commands: mpsc::Sender<M::Command>,
}

impl<M: Mirror> Clone for MirrorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            snapshots: self.snapshots.clone(),
            commands: self.commands.clone(),
        }
    }
}

impl<M: Mirror> MirrorHandle<M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> M::Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified on every published snapshot
    pub fn watch(&self) -> watch::Receiver<M::Snapshot> {
        self.snapshots.clone()
    }

    /// Queue a command behind any pending change events.
    pub async fn send(&self, command: M::Command) -> FeedResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| FeedError::Closed(self.name.clone()))
    }

    /// Handle serving a fixed snapshot with no worker behind it
    #[cfg(test)]
    pub(crate) fn detached(name: &str, snapshot: M::Snapshot) -> Self {
        let (_publisher, snapshots) = watch::channel(snapshot);
        let (commands, _) = mpsc::channel(1);
        Self {
            name: name.to_string(),
            snapshots,
            commands,
        }
    }
}

enum Step<C> {
    Shutdown,
    Command(C),
    Change(Option<FeedResult<RawChange>>),
    Resubscribe,
}

/// Owner of one mirror
pub struct MirrorWorker<M: Mirror> {
    mirror: M,
    datastore: Arc<dyn Datastore>,
    publisher: watch::Sender<M::Snapshot>,
    commands: mpsc::Receiver<M::Command>,
    policy: ResubscribePolicy,
}

impl<M: Mirror> MirrorWorker<M> {
    pub fn new(
        mirror: M,
        datastore: Arc<dyn Datastore>,
        policy: ResubscribePolicy,
    ) -> (Self, MirrorHandle<M>) {
        let (publisher, snapshots) = watch::channel(mirror.snapshot());
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);

        let handle = MirrorHandle {
            name: mirror.name().to_string(),
            snapshots,
            commands: command_tx,
        };

        let worker = Self {
            mirror,
            datastore,
            publisher,
            commands,
            policy,
        };

        (worker, handle)
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Subscribes before fetching so nothing written between the read and the
    /// subscription is lost; notifications buffered during the fetch are
    /// applied on top of the fetched rows.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let name = self.mirror.name().to_string();
        info!(feed = %name, table = %self.mirror.table(), "Starting feed worker");

        self.mirror.begin_loading();
        self.publish();

        let mut changes = self.subscribe().await;
        self.initialize(&shutdown).await;
        if changes.is_none() {
            self.mirror.mark_stale();
            self.publish();
        }

        let mut backoff = self.policy.backoff();
        let mut retry_at: Option<Instant> = None;

        loop {
            let step = match changes.as_mut() {
                Some(stream) => tokio::select! {
                    _ = shutdown.cancelled() => Step::Shutdown,
                    Some(command) = self.commands.recv() => Step::Command(command),
                    next = stream.next() => Step::Change(next),
                },
                None => {
                    let deadline = *retry_at.get_or_insert_with(|| {
                        let delay = backoff.next_backoff().unwrap_or(self.policy.max_delay);
                        warn!(feed = %name, delay_ms = delay.as_millis() as u64, "Resubscribing after delay");
                        Instant::now() + delay
                    });

                    tokio::select! {
                        _ = shutdown.cancelled() => Step::Shutdown,
                        Some(command) = self.commands.recv() => Step::Command(command),
                        _ = tokio::time::sleep_until(deadline) => Step::Resubscribe,
                    }
                }
            };

            match step {
                Step::Shutdown => break,
                Step::Command(command) => {
                    self.mirror.handle_command(command);
                    self.publish();
                }
                Step::Change(Some(Ok(raw))) => self.on_change_event(raw),
                Step::Change(Some(Err(e @ FeedError::SubscriptionFailure { .. }))) => {
                    error!(feed = %name, error = %e, "Change subscription dropped");
                    changes = None;
                    self.go_stale();
                }
                Step::Change(Some(Err(e))) => self.drop_event(&e),
                Step::Change(None) => {
                    warn!(feed = %name, "Change stream ended");
                    changes = None;
                    self.go_stale();
                }
                Step::Resubscribe => {
                    retry_at = None;
                    changes = self.subscribe().await;
                    if changes.is_some() {
                        backoff.reset();
                        metrics::counter!("feed.resubscribes", "feed" => name.clone()).increment(1);
                        // catch up on whatever changed while unsubscribed
                        self.initialize(&shutdown).await;
                    }
                }
            }
        }

        info!(feed = %name, "Feed worker stopped");
    }

    async fn subscribe(&self) -> Option<ChangeStream> {
        match self.datastore.subscribe(self.mirror.table()).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                error!(feed = %self.mirror.name(), error = %e, "Failed to subscribe to changes");
                None
            }
        }
    }

    /// Bulk read; the result is discarded if the worker was torn down meanwhile.
    #[instrument(skip_all, fields(feed = %self.mirror.name()))]
    async fn initialize(&mut self, shutdown: &CancellationToken) {
        let query = self.mirror.initial_query();

        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = self.datastore.select(&query) => result,
        };

        if shutdown.is_cancelled() {
            return;
        }

        match result {
            Ok(rows) => self.mirror.load(rows),
            Err(e) => {
                error!(error = %e, "Initial fetch failed");
                metrics::counter!("feed.fetch.failed", "feed" => self.mirror.name().to_string())
                    .increment(1);
                self.mirror.mark_stale();
            }
        }

        self.publish();
    }

    fn on_change_event(&mut self, raw: RawChange) {
        match self.mirror.on_change_event(raw) {
            Ok(()) => {
                metrics::counter!("feed.events.applied", "feed" => self.mirror.name().to_string())
                    .increment(1);
                self.publish();
            }
            Err(e) => self.drop_event(&e),
        }
    }

    fn drop_event(&self, error: &FeedError) {
        warn!(
            feed = %self.mirror.name(),
            error = %error,
            kind = error.kind(),
            "Dropping change event"
        );
        metrics::counter!(
            "feed.events.dropped",
            "feed" => self.mirror.name().to_string(),
            "reason" => error.kind()
        )
        .increment(1);
    }

    fn go_stale(&mut self) {
        self.mirror.mark_stale();
        self.publish();
    }

    fn publish(&self) {
        self.publisher.send_replace(self.mirror.snapshot());
    }
}

/// Spawn a worker for `mirror` on the current runtime.
pub fn spawn_mirror<M: Mirror>(
    mirror: M,
    datastore: Arc<dyn Datastore>,
    policy: ResubscribePolicy,
    shutdown: CancellationToken,
) -> (MirrorHandle<M>, JoinHandle<()>) {
    let (worker, handle) = MirrorWorker::new(mirror, datastore, policy);
    let task = tokio::spawn(worker.run(shutdown));
    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::ChangeOperation;
    use crate::datastore::MockDatastore;
    use crate::feed::{FeedRecord, FeedSettings, FeedSnapshot, FeedState, FeedStore, Retention};
    use crate::records::Detection;
    use futures::stream;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    type Changes = mpsc::UnboundedSender<FeedResult<RawChange>>;

    fn detections_store() -> FeedStore<Detection> {
        FeedStore::new(FeedSettings {
            name: "detections".to_string(),
            table: "detections".to_string(),
            order_by: "timestamp".to_string(),
            retention: Retention::Bounded(50),
            dedup_by_id: true,
        })
    }

    fn row(id: i64, secs: u32) -> serde_json::Value {
        json!({
            "id": id,
            "timestamp": format!("2024-01-01T00:00:{secs:02}"),
            "latitude": 13.07,
            "longitude": 77.57
        })
    }

    fn insert(id: i64, secs: u32) -> RawChange {
        RawChange {
            table: "detections".to_string(),
            operation: ChangeOperation::Insert,
            record: Some(row(id, secs)),
            old_record: None,
        }
    }

    fn channel_stream() -> (Changes, ChangeStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (tx, stream.boxed())
    }

    fn ids(snapshot: &FeedSnapshot<Detection>) -> Vec<i64> {
        snapshot.records.iter().map(|d| d.id).collect()
    }

    async fn wait_until(
        handle: &MirrorHandle<FeedStore<Detection>>,
        condition: impl FnMut(&FeedSnapshot<Detection>) -> bool,
    ) -> FeedSnapshot<Detection> {
        let mut rx = handle.watch();
        let snapshot = timeout(Duration::from_secs(5), rx.wait_for(condition))
            .await
            .expect("timed out waiting for snapshot")
            .expect("worker stopped");
        snapshot.clone()
    }

    fn fast_policy() -> ResubscribePolicy {
        ResubscribePolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_fetch_then_live_inserts() {
        let (changes, stream) = channel_stream();

        let mut datastore = MockDatastore::new();
        datastore
            .expect_subscribe()
            .times(1)
            .return_once(move |_| Ok(stream));
        datastore
            .expect_select()
            .withf(|q| q.table == "detections" && q.descending && q.limit == Some(50))
            .times(1)
            .returning(|_| Ok(vec![row(3, 30), row(2, 20), row(1, 10)]));

        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_mirror(
            detections_store(),
            Arc::new(datastore),
            fast_policy(),
            shutdown.clone(),
        );

        let snapshot = wait_until(&handle, |s| s.ready).await;
        assert_eq!(ids(&snapshot), vec![3, 2, 1]);
        assert!(!snapshot.stale);

        changes.send(Ok(insert(4, 40))).unwrap();
        let snapshot = wait_until(&handle, |s| s.records.len() == 4).await;
        assert_eq!(ids(&snapshot), vec![4, 3, 2, 1]);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_fetch_stays_loading() {
        let (changes, stream) = channel_stream();

        let mut datastore = MockDatastore::new();
        datastore
            .expect_subscribe()
            .return_once(move |_| Ok(stream));
        datastore
            .expect_select()
            .times(1)
            .returning(|q| Err(FeedError::fetch(&q.table, "connection refused")));

        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_mirror(
            detections_store(),
            Arc::new(datastore),
            fast_policy(),
            shutdown.clone(),
        );

        let snapshot = wait_until(&handle, |s| s.stale).await;
        assert_eq!(snapshot.state, FeedState::Loading);
        assert!(!snapshot.ready);
        assert!(snapshot.records.is_empty());

        // the subscription path still delivers
        changes.send(Ok(insert(1, 10))).unwrap();
        let snapshot = wait_until(&handle, |s| !s.records.is_empty()).await;
        assert_eq!(snapshot.state, FeedState::Loading);
        assert_eq!(ids(&snapshot), vec![1]);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_events_are_dropped() {
        let (changes, stream) = channel_stream();

        let mut datastore = MockDatastore::new();
        datastore
            .expect_subscribe()
            .return_once(move |_| Ok(stream));
        datastore.expect_select().returning(|_| Ok(vec![]));

        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_mirror(
            detections_store(),
            Arc::new(datastore),
            fast_policy(),
            shutdown.clone(),
        );
        wait_until(&handle, |s| s.ready).await;

        let mut missing_fields = insert(1, 10);
        missing_fields.record = Some(json!({"id": 1}));
        let mut wrong_table = insert(2, 20);
        wrong_table.table = "person_count".to_string();

        changes.send(Ok(missing_fields)).unwrap();
        changes.send(Ok(wrong_table)).unwrap();
        changes
            .send(Err(FeedError::MalformedEvent("undecodable payload".to_string())))
            .unwrap();
        changes.send(Ok(insert(3, 30))).unwrap();

        let snapshot = wait_until(&handle, |s| !s.records.is_empty()).await;
        assert_eq!(ids(&snapshot), vec![3]);
        assert!(!snapshot.stale);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_subscription_resubscribes_and_refetches() {
        let subscribes = Arc::new(AtomicUsize::new(0));
        let selects = Arc::new(AtomicUsize::new(0));

        let mut datastore = MockDatastore::new();
        let counter = subscribes.clone();
        datastore.expect_subscribe().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                // first channel closes straight away
                Ok(stream::empty().boxed())
            } else {
                Ok(stream::pending().boxed())
            }
        });
        let counter = selects.clone();
        datastore.expect_select().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![row(1, 10)])
            } else {
                Ok(vec![row(2, 20), row(1, 10)])
            }
        });

        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_mirror(
            detections_store(),
            Arc::new(datastore),
            fast_policy(),
            shutdown.clone(),
        );

        let snapshot = wait_until(&handle, |s| s.records.len() == 2).await;
        assert_eq!(ids(&snapshot), vec![2, 1]);
        assert!(snapshot.ready);
        assert!(!snapshot.stale);
        assert_eq!(subscribes.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_listener_connection_refetches() {
        let subscribes = Arc::new(AtomicUsize::new(0));
        let selects = Arc::new(AtomicUsize::new(0));

        let mut datastore = MockDatastore::new();
        let counter = subscribes.clone();
        datastore.expect_subscribe().returning(move |table| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                // connection lost, stream left open
                let lost = FeedError::subscription(table, "connection lost");
                Ok(stream::iter(vec![Err(lost)]).chain(stream::pending()).boxed())
            } else {
                Ok(stream::pending().boxed())
            }
        });
        let counter = selects.clone();
        datastore.expect_select().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![row(1, 10)])
            } else {
                // written while the listener was reconnecting
                Ok(vec![row(2, 20), row(1, 10)])
            }
        });

        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_mirror(
            detections_store(),
            Arc::new(datastore),
            fast_policy(),
            shutdown.clone(),
        );

        let snapshot = wait_until(&handle, |s| s.records.len() == 2 && !s.stale).await;
        assert_eq!(ids(&snapshot), vec![2, 1]);
        assert_eq!(subscribes.load(Ordering::SeqCst), 2);
        assert_eq!(selects.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_subscribe_marks_stale() {
        let mut datastore = MockDatastore::new();
        datastore
            .expect_subscribe()
            .returning(|table| Err(FeedError::subscription(table, "listener refused")));
        datastore.expect_select().returning(|_| Ok(vec![row(1, 10)]));

        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_mirror(
            detections_store(),
            Arc::new(datastore),
            fast_policy(),
            shutdown.clone(),
        );

        let snapshot = wait_until(&handle, |s| s.ready && s.stale).await;
        assert_eq!(ids(&snapshot), vec![1]);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_add_local_through_handle() {
        let (_changes, stream) = channel_stream();

        let mut datastore = MockDatastore::new();
        datastore
            .expect_subscribe()
            .return_once(move |_| Ok(stream));
        datastore.expect_select().returning(|_| Ok(vec![row(1, 10)]));

        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_mirror(
            detections_store(),
            Arc::new(datastore),
            fast_policy(),
            shutdown.clone(),
        );
        wait_until(&handle, |s| s.ready).await;

        let local = Detection::from_row(row(5, 50)).unwrap();
        tokio_test::assert_ok!(handle.add_local(local).await);

        let snapshot = wait_until(&handle, |s| s.records.len() == 2).await;
        assert_eq!(ids(&snapshot), vec![5, 1]);

        shutdown.cancel();
        task.await.unwrap();

        assert!(matches!(
            handle.add_local(Detection::from_row(row(6, 59)).unwrap()).await,
            Err(FeedError::Closed(_))
        ));
    }
}
