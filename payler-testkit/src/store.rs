use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use payler::store::{DocumentStore, StoredDocument};
use payler::{Payload, PaylerError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

/// Document store kept in memory.
///
/// Clones share the same documents, so a test can hand one clone to a
/// [`payler::StoreDriver`] and inspect the other.
#[derive(Clone)]
pub struct InMemoryDocumentStore {
    collection: String,
    documents: Arc<Mutex<BTreeMap<Uuid, StoredDocument>>>,
    indexes: Arc<Mutex<BTreeSet<String>>>,
    reachable: Arc<Mutex<bool>>,
    failing: Arc<Mutex<bool>>,
    rejects_index: Arc<Mutex<bool>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::named("payler_payloads")
    }

    pub fn named(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            documents: Arc::new(Mutex::new(BTreeMap::new())),
            indexes: Arc::new(Mutex::new(BTreeSet::new())),
            reachable: Arc::new(Mutex::new(true)),
            failing: Arc::new(Mutex::new(false)),
            rejects_index: Arc::new(Mutex::new(false)),
        }
    }

    /// Store a raw document, bypassing payload validation.
    pub fn insert_document(&self, document: StoredDocument) -> Uuid {
        let id = document.id;
        self.documents.lock().insert(id, document);
        id
    }

    pub fn documents(&self) -> Vec<StoredDocument> {
        self.documents.lock().values().cloned().collect()
    }

    pub fn get(&self, id: Uuid) -> Option<StoredDocument> {
        self.documents.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.documents.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.documents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.lock().is_empty()
    }

    pub fn index_count(&self) -> usize {
        self.indexes.lock().len()
    }

    pub fn set_reachable(&self, reachable: bool) {
        *self.reachable.lock() = reachable;
    }

    /// Make every data operation fail with a backend error.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    /// Make index creation fail with a setup error.
    pub fn set_rejects_index(&self, rejects: bool) {
        *self.rejects_index.lock() = rejects;
    }

    fn check(&self, operation: &str) -> Result<()> {
        if *self.failing.lock() {
            return Err(PaylerError::backend(anyhow::anyhow!(
                "{operation} failed: store unavailable"
            )));
        }
        Ok(())
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn ensure_index(&self) -> Result<String> {
        let index = format!("{}_reference_date_idx", self.collection);
        if *self.rejects_index.lock() {
            return Err(PaylerError::setup(anyhow::anyhow!(
                "creating index {index} was refused"
            )));
        }
        self.indexes.lock().insert(index.clone());
        Ok(index)
    }

    async fn ping(&self) -> bool {
        *self.reachable.lock()
    }

    async fn insert(&self, payload: &Payload) -> Result<Uuid> {
        self.check("insert")?;
        let id = Uuid::now_v7();
        self.documents
            .lock()
            .insert(id, StoredDocument::from_payload(id, payload));
        Ok(id)
    }

    async fn find_ready(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<StoredDocument>> {
        self.check("find")?;
        let mut ready: Vec<_> = self
            .documents
            .lock()
            .values()
            .filter(|doc| doc.reference_date <= now)
            .cloned()
            .collect();
        ready.sort_by_key(|doc| doc.reference_date);
        Ok(ready)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.check("delete")?;
        Ok(self.documents.lock().remove(&id).is_some())
    }
}
