//! Polling scheduler for the store driver.
//!
//! A [`Poller`] repeatedly asks its [`DocumentStore`] for every document due
//! at "now", hands each one to the bound action and deletes the ones that
//! were replayed. The loop is an explicit [`PollState`] machine so a single
//! pass can be driven deterministically with [`Poller::run_pass`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::clock::Clock;
use crate::config::PollMode;
use crate::driver::Binding;
use crate::error::Result;
use crate::metrics::{JobCounter, JobStatus};
use crate::runtime::ShutdownToken;
use crate::store::{DocumentStore, StoredDocument};
use crate::telemetry::{instrument_dispatch, poll_pass_span, record_job_outcome};

/// States of the polling loop.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollState {
    Idle,
    Querying,
    /// Documents found by the last query, snapshotted at pass start.
    Dispatching(Vec<StoredDocument>),
    Sleeping,
    Stopped,
}

/// Counts for one query-and-dispatch pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PassReport {
    /// Documents due when the pass started.
    pub found: usize,
    /// Documents replayed and deleted.
    pub processed: usize,
    /// Documents left in place for the next pass.
    pub failed: usize,
}

pub struct Poller<S: DocumentStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    mode: PollMode,
}

impl<S: DocumentStore> Poller<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        mode: PollMode,
    ) -> Self {
        Self {
            store,
            clock,
            interval,
            mode,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn mode(&self) -> PollMode {
        self.mode
    }

    /// Query due documents and dispatch them once.
    pub async fn run_pass(
        &self,
        driver: &str,
        binding: &Binding<StoredDocument>,
        metrics: &JobCounter,
    ) -> Result<PassReport> {
        let documents = self.query().await?;
        self.dispatch(driver, binding, metrics, documents)
            .instrument(poll_pass_span(driver))
            .await
    }

    /// Drive the state machine until shutdown, a fatal error, or the end of
    /// the single pass in [`PollMode::Once`].
    pub async fn run(
        &self,
        driver: &str,
        binding: &Binding<StoredDocument>,
        metrics: &JobCounter,
        shutdown: ShutdownToken,
    ) -> Result<()> {
        let mut state = PollState::Idle;

        loop {
            state = match state {
                PollState::Idle if shutdown.is_cancelled() => PollState::Stopped,
                PollState::Idle => PollState::Querying,
                PollState::Querying => {
                    PollState::Dispatching(self.query().await?)
                }
                PollState::Dispatching(documents) => {
                    let report = self
                        .dispatch(driver, binding, metrics, documents)
                        .instrument(poll_pass_span(driver))
                        .await?;
                    tracing::debug!(
                        driver = %driver,
                        found = report.found,
                        processed = report.processed,
                        failed = report.failed,
                        "poll pass done"
                    );
                    match self.mode {
                        PollMode::Once => PollState::Stopped,
                        PollMode::Loop => PollState::Sleeping,
                    }
                }
                PollState::Sleeping => {
                    tokio::select! {
                        _ = shutdown.cancelled() => PollState::Stopped,
                        _ = tokio::time::sleep(self.interval) => PollState::Idle,
                    }
                }
                PollState::Stopped => {
                    tracing::info!(driver = %driver, "store poller stopped");
                    return Ok(());
                }
            };
        }
    }

    async fn query(&self) -> Result<Vec<StoredDocument>> {
        let now = self.clock.now();
        self.store.find_ready(now).await
    }

    async fn dispatch(
        &self,
        driver: &str,
        binding: &Binding<StoredDocument>,
        metrics: &JobCounter,
        documents: Vec<StoredDocument>,
    ) -> Result<PassReport> {
        let label = binding.label(driver);
        let mut report = PassReport {
            found: documents.len(),
            ..PassReport::default()
        };

        for document in documents {
            let reference = document.id.to_string();
            let outcome = instrument_dispatch(
                driver,
                &reference,
                binding.action.call(&document, binding.downstream.as_ref()),
            )
            .await;

            match outcome {
                Ok(delivery) if delivery.success => {
                    if !self.store.delete(document.id).await? {
                        tracing::debug!(
                            driver = %driver,
                            id = %document.id,
                            "document already removed"
                        );
                    }
                    record_job_outcome(
                        metrics,
                        label,
                        JobStatus::Success,
                        &reference,
                    );
                    report.processed += 1;
                }
                Ok(_) => {
                    tracing::warn!(
                        driver = %driver,
                        id = %document.id,
                        "action reported an unsuccessful delivery, keeping document"
                    );
                    record_job_outcome(
                        metrics,
                        label,
                        JobStatus::Failed,
                        &reference,
                    );
                    report.failed += 1;
                }
                Err(err) if err.is_recoverable() => {
                    tracing::error!(
                        driver = %driver,
                        id = %document.id,
                        reason = %err,
                        "could not replay document, keeping it for the next pass"
                    );
                    record_job_outcome(
                        metrics,
                        label,
                        JobStatus::Failed,
                        &reference,
                    );
                    report.failed += 1;
                }
                Err(err) => {
                    tracing::error!(
                        driver = %driver,
                        id = %document.id,
                        error = %err,
                        "backend failure while replaying document"
                    );
                    record_job_outcome(
                        metrics,
                        label,
                        JobStatus::Failed,
                        &reference,
                    );
                    return Err(err);
                }
            }
        }

        Ok(report)
    }
}

impl<S: DocumentStore> fmt::Debug for Poller<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("clock", &self.clock)
            .field("interval", &self.interval)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use uuid::Uuid;

    use super::*;
    use crate::clock::ManualClock;
    use crate::driver::{
        Action, Delivery, DeliveryData, Driver, ListenOptions, ProcessOptions,
    };
    use crate::error::PaylerError;
    use crate::payload::Payload;

    #[derive(Default)]
    struct VecStore {
        docs: Mutex<BTreeMap<Uuid, StoredDocument>>,
    }

    impl VecStore {
        fn put(&self, at: DateTime<Utc>, destination: Option<&str>) -> Uuid {
            let id = Uuid::new_v4();
            self.docs.lock().insert(
                id,
                StoredDocument {
                    id,
                    message: b"m".to_vec(),
                    reference_date: at,
                    source: Some("in".into()),
                    destination: destination.map(str::to_string),
                },
            );
            id
        }
    }

    #[async_trait]
    impl DocumentStore for VecStore {
        fn collection(&self) -> &str {
            "vec"
        }

        async fn ensure_index(&self) -> Result<String> {
            Ok("vec_idx".into())
        }

        async fn ping(&self) -> bool {
            true
        }

        async fn insert(&self, payload: &Payload) -> Result<Uuid> {
            Ok(self.put(payload.release_at(), Some(payload.destination())))
        }

        async fn find_ready(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<StoredDocument>> {
            Ok(self
                .docs
                .lock()
                .values()
                .filter(|d| d.reference_date <= now)
                .cloned()
                .collect())
        }

        async fn delete(&self, id: Uuid) -> Result<bool> {
            Ok(self.docs.lock().remove(&id).is_some())
        }
    }

    struct Sink;

    #[async_trait]
    impl Driver for Sink {
        fn name(&self) -> &str {
            "sink"
        }

        async fn setup(&self) -> Result<String> {
            Ok("sink".into())
        }

        async fn is_reachable(&self) -> bool {
            true
        }

        async fn process(
            &self,
            payload: Payload,
            _options: &ProcessOptions,
        ) -> Result<Delivery> {
            Ok(Delivery::succeeded(payload, DeliveryData::Recorded { index: 0 }))
        }
    }

    struct Replay;

    #[async_trait]
    impl Action<StoredDocument> for Replay {
        fn name(&self) -> &str {
            "replay"
        }

        async fn call(
            &self,
            message: &StoredDocument,
            downstream: &dyn Driver,
        ) -> Result<Delivery> {
            let payload = message.to_payload()?;
            downstream.process(payload, &ProcessOptions::default()).await
        }
    }

    struct Broken;

    #[async_trait]
    impl Action<StoredDocument> for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn call(
            &self,
            _message: &StoredDocument,
            _downstream: &dyn Driver,
        ) -> Result<Delivery> {
            Err(PaylerError::backend(anyhow::anyhow!("broker down")))
        }
    }

    fn binding(action: Arc<dyn Action<StoredDocument>>) -> Binding<StoredDocument> {
        Binding {
            action,
            downstream: Arc::new(Sink),
            options: ListenOptions::labeled("watch"),
        }
    }

    fn poller(store: Arc<VecStore>, clock: Arc<ManualClock>, mode: PollMode) -> Poller<VecStore> {
        Poller::new(store, clock, Duration::from_millis(50), mode)
    }

    #[tokio::test]
    async fn pass_replays_due_documents_and_keeps_malformed_ones() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(VecStore::default());
        let now = clock.now();
        let due = store.put(now - chrono::Duration::seconds(1), Some("out"));
        let malformed = store.put(now, None);
        let later = store.put(now + chrono::Duration::hours(1), Some("out"));
        let metrics = JobCounter::new().unwrap();

        let report = poller(Arc::clone(&store), clock, PollMode::Once)
            .run_pass("store", &binding(Arc::new(Replay)), &metrics)
            .await
            .unwrap();

        assert_eq!(
            report,
            PassReport {
                found: 2,
                processed: 1,
                failed: 1
            }
        );
        let left = store.docs.lock();
        assert!(!left.contains_key(&due));
        assert!(left.contains_key(&malformed));
        assert!(left.contains_key(&later));
        assert_eq!(metrics.get("watch", JobStatus::Success), 1);
        assert_eq!(metrics.get("watch", JobStatus::Failed), 1);
    }

    #[tokio::test]
    async fn backend_failure_ends_the_pass_and_keeps_the_document() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(VecStore::default());
        let id = store.put(clock.now(), Some("out"));
        let metrics = JobCounter::new().unwrap();

        let err = poller(Arc::clone(&store), clock, PollMode::Once)
            .run_pass("store", &binding(Arc::new(Broken)), &metrics)
            .await
            .unwrap_err();

        assert!(matches!(err, PaylerError::Backend(_)));
        assert!(store.docs.lock().contains_key(&id));
        assert_eq!(metrics.get("watch", JobStatus::Failed), 1);
    }

    #[tokio::test]
    async fn once_mode_returns_after_one_pass() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(VecStore::default());
        store.put(clock.now(), Some("out"));
        let metrics = JobCounter::new().unwrap();

        poller(Arc::clone(&store), clock, PollMode::Once)
            .run("store", &binding(Arc::new(Replay)), &metrics, ShutdownToken::new())
            .await
            .unwrap();

        assert!(store.docs.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_mode_picks_up_documents_on_later_passes() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(VecStore::default());
        let metrics = JobCounter::new().unwrap();
        let shutdown = ShutdownToken::new();
        let poller = poller(Arc::clone(&store), Arc::clone(&clock), PollMode::Loop);
        let binding = binding(Arc::new(Replay));

        let run = poller.run("store", &binding, &metrics, shutdown.clone());
        let drive = async {
            store.put(clock.now() + chrono::Duration::milliseconds(10), Some("out"));
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(store.docs.lock().len(), 1);

            clock.advance(chrono::Duration::milliseconds(20));
            tokio::time::sleep(Duration::from_millis(60)).await;
            assert!(store.docs.lock().is_empty());
            shutdown.cancel();
        };

        let (result, ()) = tokio::join!(run, drive);
        result.unwrap();
        assert_eq!(metrics.get("watch", JobStatus::Success), 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_querying() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(VecStore::default());
        store.put(clock.now(), Some("out"));
        let shutdown = ShutdownToken::new();
        shutdown.cancel();
        let metrics = JobCounter::new().unwrap();

        poller(Arc::clone(&store), clock, PollMode::Loop)
            .run("store", &binding(Arc::new(Replay)), &metrics, shutdown)
            .await
            .unwrap();

        assert_eq!(store.docs.lock().len(), 1);
    }
}
