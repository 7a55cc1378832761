use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use payler::*;
use std::sync::Arc;

/// Scripted failure for [`RecordingDriver`] and [`RecordingAction`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Failure {
    /// Fail with [`PaylerError::Processing`].
    Processing,
    /// Fail with [`PaylerError::Backend`].
    Backend,
    /// Return a delivery whose `success` is false.
    Unsuccessful,
}

impl Failure {
    fn into_result(self, payload: Payload, index: usize) -> Result<Delivery> {
        match self {
            Failure::Processing => {
                Err(PaylerError::processing("scripted processing failure"))
            }
            Failure::Backend => Err(PaylerError::backend(anyhow::anyhow!(
                "scripted backend failure"
            ))),
            Failure::Unsuccessful => {
                let mut delivery =
                    Delivery::succeeded(payload, DeliveryData::Recorded { index });
                delivery.success = false;
                Ok(delivery)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProcessRecord {
    pub payload: Payload,
    pub options: ProcessOptions,
}

/// Driver sink that keeps every processed payload.
#[derive(Clone)]
pub struct RecordingDriver {
    name: String,
    records: Arc<Mutex<Vec<ProcessRecord>>>,
    failure: Arc<Mutex<Option<Failure>>>,
    setups: Arc<Mutex<usize>>,
    metrics: Option<JobCounter>,
}

impl RecordingDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Arc::new(Mutex::new(Vec::new())),
            failure: Arc::new(Mutex::new(None)),
            setups: Arc::new(Mutex::new(0)),
            metrics: None,
        }
    }

    /// Count successful `process` calls like a real driver does.
    pub fn with_metrics(mut self, metrics: JobCounter) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn records(&self) -> Vec<ProcessRecord> {
        self.records.lock().clone()
    }

    pub fn payloads(&self) -> Vec<Payload> {
        self.records.lock().iter().map(|r| r.payload.clone()).collect()
    }

    pub fn setups(&self) -> usize {
        *self.setups.lock()
    }

    pub fn assert_process_count_eq(&self, expected: usize) {
        assert_eq!(
            self.records.lock().len(),
            expected,
            "Expected {} processed payloads, got {}",
            expected,
            self.records.lock().len()
        );
    }

    pub fn set_failure(&self, failure: Option<Failure>) {
        *self.failure.lock() = failure;
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

#[async_trait]
impl Driver for RecordingDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&self) -> Result<String> {
        *self.setups.lock() += 1;
        Ok(format!("{}-sink", self.name))
    }

    async fn is_reachable(&self) -> bool {
        true
    }

    async fn process(
        &self,
        payload: Payload,
        options: &ProcessOptions,
    ) -> Result<Delivery> {
        let index = self.records.lock().len();
        if let Some(failure) = *self.failure.lock() {
            return failure.into_result(payload, index);
        }

        self.records.lock().push(ProcessRecord {
            payload: payload.clone(),
            options: options.clone(),
        });
        if let Some(metrics) = &self.metrics {
            metrics.record(&self.name, JobStatus::Success);
        }
        Ok(Delivery::succeeded(payload, DeliveryData::Recorded { index }))
    }
}

/// Action that records every message it sees without calling downstream.
pub struct RecordingAction<M> {
    seen: Arc<Mutex<Vec<M>>>,
    failure: Arc<Mutex<Option<Failure>>>,
}

impl<M> RecordingAction<M> {
    pub fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_failure(&self, failure: Option<Failure>) {
        *self.failure.lock() = failure;
    }
}

impl<M: Clone> RecordingAction<M> {
    pub fn seen(&self) -> Vec<M> {
        self.seen.lock().clone()
    }
}

impl<M> Clone for RecordingAction<M> {
    fn clone(&self) -> Self {
        Self {
            seen: Arc::clone(&self.seen),
            failure: Arc::clone(&self.failure),
        }
    }
}

impl<M> Default for RecordingAction<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<M> Action<M> for RecordingAction<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "recording"
    }

    async fn call(&self, message: &M, _downstream: &dyn Driver) -> Result<Delivery> {
        let index = {
            let mut seen = self.seen.lock();
            seen.push(message.clone());
            seen.len() - 1
        };
        let payload = Payload::new(Bytes::new(), Utc::now(), "recording", "recording")?;
        if let Some(failure) = *self.failure.lock() {
            return failure.into_result(payload, index);
        }
        Ok(Delivery::succeeded(payload, DeliveryData::Recorded { index }))
    }
}
