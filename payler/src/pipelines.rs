//! The two built-in pipelines.
//!
//! `client.process_queue` consumes the inbound broker queue and spools each
//! message into the store. `client.watch_storage` polls the store and
//! replays due payloads to the broker. The generic [`spool`] and [`replay`]
//! helpers do the wiring and work with any transport or store.

use std::sync::Arc;

use crate::actions::{ReplayAction, SpoolAction};
use crate::broker::{BrokerDriver, BrokerTransport};
use crate::driver::{Driver, ListenOptions, Listener};
use crate::error::Result;
use crate::runtime::ShutdownToken;
use crate::store::{DocumentStore, StoreDriver};

/// Location of the broker-to-store pipeline.
pub const PROCESS_QUEUE: &str = "client.process_queue";
/// Location of the store-to-broker pipeline.
pub const WATCH_STORAGE: &str = "client.watch_storage";

/// Listen on `broker` and spool every message into `store`.
///
/// Both drivers are set up first; `label` names the workflow in metrics.
pub async fn spool<T: BrokerTransport>(
    broker: &BrokerDriver<T>,
    store: Arc<dyn Driver>,
    action: SpoolAction,
    label: &str,
    shutdown: ShutdownToken,
) -> Result<()> {
    let queue = broker.setup().await?;
    let index = store.setup().await?;
    tracing::info!(queue = %queue, index = %index, "spool pipeline ready");

    broker.configure(Arc::new(action), store, ListenOptions::labeled(label))?;
    broker.listen(shutdown).await
}

/// Watch `store` and replay every due document through `broker`.
pub async fn replay<S: DocumentStore>(
    store: &StoreDriver<S>,
    broker: Arc<dyn Driver>,
    label: &str,
    shutdown: ShutdownToken,
) -> Result<()> {
    let index = store.setup().await?;
    let queue = broker.setup().await?;
    tracing::info!(queue = %queue, index = %index, "replay pipeline ready");

    store.configure(Arc::new(ReplayAction), broker, ListenOptions::labeled(label))?;
    store.listen(shutdown).await
}

#[cfg(all(feature = "nats", feature = "postgres"))]
mod client {
    use std::sync::Arc;

    use super::{replay, spool, PROCESS_QUEUE, WATCH_STORAGE};
    use crate::actions::SpoolAction;
    use crate::broker::{BrokerDriver, NatsTransport};
    use crate::error::Result;
    use crate::runtime::{ActionRegistry, WorkflowContext};
    use crate::store::{PostgresDocumentStore, StoreDriver};

    /// Consume the inbound queue and spool messages into the store.
    pub async fn process_queue(ctx: WorkflowContext) -> Result<()> {
        let broker = BrokerDriver::<NatsTransport>::connect(
            ctx.settings.broker.clone(),
            ctx.metrics.clone(),
        )
        .await?;
        let store = StoreDriver::<PostgresDocumentStore>::connect(
            ctx.settings.store.clone(),
            ctx.metrics.clone(),
        )
        .await?;
        let action =
            SpoolAction::new(&ctx.settings.broker.extra.default_destination);

        spool(&broker, Arc::new(store), action, &ctx.name, ctx.shutdown).await
    }

    /// Poll the store and replay due payloads to the broker.
    pub async fn watch_storage(ctx: WorkflowContext) -> Result<()> {
        let store = StoreDriver::<PostgresDocumentStore>::connect(
            ctx.settings.store.clone(),
            ctx.metrics.clone(),
        )
        .await?;
        let broker = BrokerDriver::<NatsTransport>::connect(
            ctx.settings.broker.clone(),
            ctx.metrics.clone(),
        )
        .await?;

        replay(&store, Arc::new(broker), &ctx.name, ctx.shutdown).await
    }

    pub fn register_defaults(registry: &mut ActionRegistry) {
        registry
            .register(PROCESS_QUEUE, process_queue)
            .register(WATCH_STORAGE, watch_storage);
    }
}

#[cfg(all(feature = "nats", feature = "postgres"))]
pub use client::{process_queue, register_defaults, watch_storage};
