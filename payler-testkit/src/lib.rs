//! Test doubles for payler.
//!
//! In-memory implementations of the broker transport and document store,
//! plus recording drivers and actions, so pipelines can be exercised
//! without NATS or PostgreSQL.

pub mod broker;
pub mod mock;
pub mod store;

pub use broker::{InMemoryBroker, PublishedMessage};
pub use mock::{Failure, ProcessRecord, RecordingAction, RecordingDriver};
pub use payler::clock::ManualClock;
pub use store::InMemoryDocumentStore;

use payler::{BrokerDriver, BrokerOptions, JobCounter, StoreDriver, StoreOptions};

/// Broker driver over a fresh [`InMemoryBroker`], returning both.
pub fn memory_broker(
    name: &str,
    options: &BrokerOptions,
    metrics: JobCounter,
) -> (BrokerDriver<InMemoryBroker>, InMemoryBroker) {
    let broker = InMemoryBroker::new();
    let driver = BrokerDriver::new(name, broker.clone(), options, metrics);
    (driver, broker)
}

/// Store driver over a fresh [`InMemoryDocumentStore`], returning both.
pub fn memory_store(
    name: &str,
    options: &StoreOptions,
    metrics: JobCounter,
) -> (StoreDriver<InMemoryDocumentStore>, InMemoryDocumentStore) {
    let store = InMemoryDocumentStore::new();
    let driver = StoreDriver::new(name, store.clone(), options, metrics);
    (driver, store)
}
