//! Store-facing driver.
//!
//! [`StoreDriver`] spools payloads into a [`DocumentStore`] and, when
//! listening, polls it for documents whose release time has passed.

#[cfg(feature = "postgres")]
pub mod postgres;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::StoreOptions;
use crate::driver::{
    Action, Binding, BindingSlot, Delivery, DeliveryData, Driver,
    ListenOptions, Listener, ProcessOptions,
};
use crate::error::{PaylerError, Result};
use crate::metrics::{JobCounter, JobStatus};
use crate::payload::Payload;
use crate::runtime::ShutdownToken;
use crate::scheduler::{PassReport, Poller};
use crate::telemetry::record_job_outcome;

#[cfg(feature = "postgres")]
pub use postgres::PostgresDocumentStore;

/// A spooled payload as read back from the store.
///
/// Routing fields are optional here: documents written by other producers
/// may lack them, which only surfaces when the document is replayed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredDocument {
    pub id: Uuid,
    pub message: Vec<u8>,
    pub reference_date: DateTime<Utc>,
    pub source: Option<String>,
    pub destination: Option<String>,
}

impl StoredDocument {
    /// Document as it would be written for `payload`.
    pub fn from_payload(id: Uuid, payload: &Payload) -> Self {
        Self {
            id,
            message: payload.message().to_vec(),
            reference_date: payload.release_at(),
            source: Some(payload.source().to_string()),
            destination: Some(payload.destination().to_string()),
        }
    }

    /// Rebuild the payload this document was spooled from.
    pub fn to_payload(&self) -> Result<Payload> {
        let source = self.source.as_deref().ok_or_else(|| {
            PaylerError::processing(format!("document {} has no source", self.id))
        })?;
        let destination = self.destination.as_deref().ok_or_else(|| {
            PaylerError::processing(format!(
                "document {} has no destination",
                self.id
            ))
        })?;
        Payload::new(
            self.message.clone(),
            self.reference_date,
            source,
            destination,
        )
    }
}

/// Durable storage of spooled payloads, indexed by release time.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Name of the collection or table documents are written to.
    fn collection(&self) -> &str;

    /// Ensure the release-time index exists; returns its name.
    async fn ensure_index(&self) -> Result<String>;

    async fn ping(&self) -> bool;

    async fn insert(&self, payload: &Payload) -> Result<Uuid>;

    /// Every document whose `reference_date` is at or before `now`.
    async fn find_ready(&self, now: DateTime<Utc>)
        -> Result<Vec<StoredDocument>>;

    /// Remove a document; `false` when it was already gone.
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

/// Driver spooling payloads and replaying them once due.
pub struct StoreDriver<S: DocumentStore> {
    name: String,
    store: Arc<S>,
    poller: Poller<S>,
    metrics: JobCounter,
    binding: BindingSlot<StoredDocument>,
}

impl<S: DocumentStore> StoreDriver<S> {
    pub fn new(
        name: impl Into<String>,
        store: S,
        options: &StoreOptions,
        metrics: JobCounter,
    ) -> Self {
        let store = Arc::new(store);
        let poller = Poller::new(
            Arc::clone(&store),
            Arc::new(SystemClock),
            options.poll_interval(),
            options.poll_mode,
        );
        Self {
            name: name.into(),
            store,
            poller,
            metrics,
            binding: BindingSlot::new(),
        }
    }

    /// Replace the clock used to decide which documents are due.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.poller = self.poller.with_clock(clock);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run a single query-and-dispatch pass with the configured action.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let binding = self.binding.get(&self.name)?;
        self.poller
            .run_pass(&self.name, binding, &self.metrics)
            .await
    }
}

impl<S: DocumentStore> fmt::Debug for StoreDriver<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreDriver")
            .field("name", &self.name)
            .field("collection", &self.store.collection())
            .field("poller", &self.poller)
            .finish()
    }
}

#[async_trait]
impl<S: DocumentStore> Driver for StoreDriver<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&self) -> Result<String> {
        let index = self.store.ensure_index().await?;
        tracing::info!(driver = %self.name, index = %index, "store index ready");
        Ok(index)
    }

    async fn is_reachable(&self) -> bool {
        self.store.ping().await
    }

    async fn process(
        &self,
        payload: Payload,
        _options: &ProcessOptions,
    ) -> Result<Delivery> {
        let id = self.store.insert(&payload).await?;

        tracing::info!(
            driver = %self.name,
            id = %id,
            release_at = %payload.release_at(),
            destination = %payload.destination(),
            "payload spooled"
        );
        record_job_outcome(
            &self.metrics,
            &self.name,
            JobStatus::Success,
            id.to_string(),
        );

        Ok(Delivery::succeeded(payload, DeliveryData::Inserted { id })
            .with_header("table", self.store.collection()))
    }
}

#[async_trait]
impl<S: DocumentStore> Listener for StoreDriver<S> {
    type Message = StoredDocument;

    fn configure(
        &self,
        action: Arc<dyn Action<StoredDocument>>,
        downstream: Arc<dyn Driver>,
        options: ListenOptions,
    ) -> Result<()> {
        self.binding.bind(
            &self.name,
            Binding {
                action,
                downstream,
                options,
            },
        )
    }

    async fn listen(&self, shutdown: ShutdownToken) -> Result<()> {
        let binding = self.binding.get(&self.name)?;

        tracing::info!(
            driver = %self.name,
            action = %binding.action.name(),
            downstream = %binding.downstream.name(),
            "watching store for due payloads"
        );

        self.poller
            .run(&self.name, binding, &self.metrics, shutdown)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(source: Option<&str>, destination: Option<&str>) -> StoredDocument {
        StoredDocument {
            id: Uuid::new_v4(),
            message: b"body".to_vec(),
            reference_date: Utc::now(),
            source: source.map(str::to_string),
            destination: destination.map(str::to_string),
        }
    }

    #[test]
    fn rebuilds_payload_from_document() {
        let doc = document(Some("payler-jobs"), Some("out"));
        let payload = doc.to_payload().unwrap();

        assert_eq!(payload.message().as_ref(), b"body");
        assert_eq!(payload.release_at(), doc.reference_date);
        assert_eq!(payload.source(), "payler-jobs");
        assert_eq!(payload.destination(), "out");
        assert_eq!(StoredDocument::from_payload(doc.id, &payload), doc);
    }

    #[test]
    fn missing_routing_fields_are_processing_errors() {
        for doc in [
            document(None, Some("out")),
            document(Some("in"), None),
            document(Some("in"), Some("")),
        ] {
            let err = doc.to_payload().unwrap_err();
            assert!(err.is_recoverable(), "{err}");
        }
    }
}
