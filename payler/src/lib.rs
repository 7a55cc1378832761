//! Payler - delayed delivery for message brokers.
//!
//! Producers publish a message with a delay header; payler spools it into a
//! durable store and replays it to its destination route once the delay has
//! passed. The broker itself never needs to support scheduled delivery.
//!
//! # Core Concepts
//!
//! - **Payload**: The unit of delayed delivery. A [`Payload`] carries the
//!   message bytes, the release time and the source and destination routes.
//!
//! - **Drivers**: The [`Driver`] and [`Listener`] traits are the contract every
//!   backend adapter implements. [`BrokerDriver`] publishes and consumes
//!   messages, [`StoreDriver`] spools payloads and polls for due ones.
//!
//! - **Actions**: An [`Action`] bridges a listener's native message to another
//!   driver's sink. [`SpoolAction`] and [`ReplayAction`] form the delay
//!   pipeline.
//!
//! - **Runtime**: The [`WorkflowRuntime`] resolves configured workflows through
//!   an [`ActionRegistry`] and runs them concurrently until shutdown.
//!
//! # Feature Flags
//!
//! - `nats` - NATS JetStream broker transport via async-nats
//! - `postgres` - PostgreSQL document store via sqlx
//!
//! Both are enabled by default. The built-in `client.process_queue` and
//! `client.watch_storage` workflows need both.
//!
//! # Example
//!
//! ```ignore
//! use payler::*;
//!
//! let mut settings = PaylerConfig::default();
//! settings.workflows = vec![
//!     WorkflowConfig::new("Consume broker payloads and store", "client.process_queue"),
//!     WorkflowConfig::new("Watch storage and publish", "client.watch_storage"),
//! ];
//!
//! let runtime = WorkflowRuntime::from_config(
//!     settings,
//!     &ActionRegistry::with_defaults(),
//!     JobCounter::new()?,
//! )?;
//! runtime.start().await?;
//! runtime.wait().await;
//! ```

/// Actions wiring a listener's messages into another driver.
///
/// The `actions` module provides [`SpoolAction`] (broker message to store)
/// and [`ReplayAction`] (due document to broker).
pub mod actions;

/// Broker-facing driver.
///
/// The `broker` module provides [`BrokerDriver`], the [`BrokerTransport`]
/// trait it runs on, and the NATS JetStream transport when the `nats`
/// feature is enabled.
pub mod broker;

/// Time sources for release computations and polling.
pub mod clock;

/// Configuration structures for drivers and workflows.
///
/// The `config` module defines [`PaylerConfig`], [`DriverConfiguration`] and
/// the typed backend options [`BrokerOptions`] and [`StoreOptions`].
pub mod config;

/// The driver contract.
pub mod driver;

/// Error taxonomy shared by every driver and the runtime.
pub mod error;

/// Prometheus job counter.
pub mod metrics;

/// The payload value object.
pub mod payload;

/// Built-in pipelines.
pub mod pipelines;

/// Workflow registry, startup and supervision.
///
/// The `runtime` module provides:
/// - [`ActionRegistry`] - resolves `module.attribute` locations
/// - [`Workflow`] and [`register_workflows`] - resolved workflows
/// - [`WorkflowRuntime`] - runs workflows concurrently
/// - [`ShutdownToken`] - graceful shutdown signaling
pub mod runtime;

/// Polling state machine used by the store driver.
pub mod scheduler;

/// Store-facing driver.
///
/// The `store` module provides [`StoreDriver`], the [`DocumentStore`] trait
/// it runs on, and the PostgreSQL store when the `postgres` feature is
/// enabled.
pub mod store;

/// Tracing spans and outcome recording.
pub mod telemetry;

pub use actions::{ReplayAction, SpoolAction};
pub use broker::{BrokerDriver, BrokerTransport, InboundMessage};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use driver::*;
pub use error::{PaylerError, Result};
pub use metrics::{JobCounter, JobStatus};
pub use payload::Payload;
pub use runtime::{
    register_workflows, ActionRegistry, ShutdownToken, Workflow,
    WorkflowContext, WorkflowRuntime,
};
pub use scheduler::{PassReport, PollState, Poller};
pub use store::{DocumentStore, StoreDriver, StoredDocument};
