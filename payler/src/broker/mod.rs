//! Broker-facing driver.
//!
//! [`BrokerDriver`] implements the driver contract over any
//! [`BrokerTransport`]. The NATS JetStream transport lives in [`nats`];
//! tests plug in an in-memory transport.

#[cfg(feature = "nats")]
pub mod nats;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::config::BrokerOptions;
use crate::driver::{
    Action, Binding, BindingSlot, Delivery, DeliveryData, Driver,
    ListenOptions, Listener, ProcessOptions,
};
use crate::error::{PaylerError, Result};
use crate::metrics::{JobCounter, JobStatus};
use crate::payload::Payload;
use crate::runtime::ShutdownToken;
use crate::telemetry::{instrument_dispatch, record_job_outcome};

#[cfg(feature = "nats")]
pub use nats::NatsTransport;

/// Header carrying the requested delay in microseconds.
pub const DELAY_HEADER: &str = "x-delay";
/// Header naming the route a spooled message is replayed to.
pub const DESTINATION_HEADER: &str = "x-destination";
/// Header added to replayed messages, naming where they were spooled from.
pub const SOURCE_HEADER: &str = "x-payler-source";

/// A message as consumed from the inbound queue.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InboundMessage {
    pub subject: String,
    pub body: Bytes,
    pub headers: BTreeMap<String, String>,
}

impl InboundMessage {
    pub fn new(subject: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Settles a consumed message with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// The message is done with and must not be redelivered.
    async fn ack(&self) -> Result<()>;
    /// The message could not be handled for transient reasons; redeliver.
    async fn nak(&self) -> Result<()>;
}

/// One consumed message together with the handle that settles it.
pub struct InboundDelivery {
    pub message: InboundMessage,
    pub acker: Box<dyn Acknowledger>,
}

impl InboundDelivery {
    pub fn new(message: InboundMessage, acker: Box<dyn Acknowledger>) -> Self {
        Self { message, acker }
    }
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Stream of inbound deliveries handed out by [`BrokerTransport::consume`].
pub type Deliveries = BoxStream<'static, Result<InboundDelivery>>;

/// Connection-level operations a broker backend must offer.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    /// Declare the inbound queue; returns the name of the declared resource.
    async fn declare(&self) -> Result<String>;

    /// True only when the connection is fully established.
    async fn is_ready(&self) -> bool;

    /// Publish `body` to `route`; the returned data is the broker's
    /// confirmation.
    async fn publish(
        &self,
        route: &str,
        headers: &BTreeMap<String, String>,
        body: Bytes,
    ) -> Result<DeliveryData>;

    /// Attach to the inbound queue.
    async fn consume(&self) -> Result<Deliveries>;
}

/// Driver publishing payloads to routes and consuming the inbound queue.
pub struct BrokerDriver<T: BrokerTransport> {
    name: String,
    transport: T,
    routing_key: String,
    metrics: JobCounter,
    binding: BindingSlot<InboundMessage>,
}

impl<T: BrokerTransport> BrokerDriver<T> {
    pub fn new(
        name: impl Into<String>,
        transport: T,
        options: &BrokerOptions,
        metrics: JobCounter,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            routing_key: options.routing_key.clone(),
            metrics,
            binding: BindingSlot::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run the action for one delivery and settle it.
    ///
    /// Malformed messages are acknowledged and dropped so they cannot loop
    /// forever; backend failures are negatively acknowledged and end the
    /// loop.
    async fn handle(
        &self,
        delivery: InboundDelivery,
        binding: &Binding<InboundMessage>,
    ) -> Result<()> {
        let InboundDelivery { message, acker } = delivery;
        let label = binding.label(&self.name);

        tracing::debug!(
            driver = %self.name,
            subject = %message.subject,
            bytes = message.body.len(),
            "processing inbound message"
        );

        let outcome = instrument_dispatch(
            &self.name,
            &message.subject,
            binding.action.call(&message, binding.downstream.as_ref()),
        )
        .await;

        match outcome {
            Ok(delivery) if delivery.success => {
                acker.ack().await?;
                record_job_outcome(
                    &self.metrics,
                    label,
                    JobStatus::Success,
                    &message.subject,
                );
                Ok(())
            }
            Ok(_) => {
                tracing::warn!(
                    driver = %self.name,
                    subject = %message.subject,
                    "action reported an unsuccessful delivery, dropping message"
                );
                acker.ack().await?;
                record_job_outcome(
                    &self.metrics,
                    label,
                    JobStatus::Failed,
                    &message.subject,
                );
                Ok(())
            }
            Err(err) if err.is_recoverable() => {
                tracing::error!(
                    driver = %self.name,
                    subject = %message.subject,
                    reason = %err,
                    payload = ?message.body,
                    "could not process message, dropping it"
                );
                acker.ack().await?;
                record_job_outcome(
                    &self.metrics,
                    label,
                    JobStatus::Failed,
                    &message.subject,
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    driver = %self.name,
                    subject = %message.subject,
                    error = %err,
                    "backend failure while processing message, requesting redelivery"
                );
                record_job_outcome(
                    &self.metrics,
                    label,
                    JobStatus::Failed,
                    &message.subject,
                );
                if let Err(nak_err) = acker.nak().await {
                    tracing::warn!(
                        driver = %self.name,
                        error = %nak_err,
                        "negative acknowledgement failed"
                    );
                }
                Err(err)
            }
        }
    }
}

impl<T: BrokerTransport> fmt::Debug for BrokerDriver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerDriver")
            .field("name", &self.name)
            .field("transport", &std::any::type_name::<T>())
            .field("routing_key", &self.routing_key)
            .finish()
    }
}

#[async_trait]
impl<T: BrokerTransport> Driver for BrokerDriver<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&self) -> Result<String> {
        self.transport.declare().await
    }

    async fn is_reachable(&self) -> bool {
        self.transport.is_ready().await
    }

    async fn process(
        &self,
        payload: Payload,
        options: &ProcessOptions,
    ) -> Result<Delivery> {
        let route = options
            .routing_key
            .as_deref()
            .unwrap_or(&self.routing_key)
            .to_string();
        if route.is_empty() {
            return Err(PaylerError::processing("empty routing key"));
        }

        tracing::info!(
            driver = %self.name,
            release_at = %payload.release_at(),
            routing_key = %route,
            "publishing payload"
        );

        let mut headers = BTreeMap::new();
        headers.insert(SOURCE_HEADER.to_string(), payload.source().to_string());
        let data = self
            .transport
            .publish(&route, &headers, payload.message().clone())
            .await?;

        tracing::debug!(driver = %self.name, routing_key = %route, "payload sent");
        record_job_outcome(&self.metrics, &self.name, JobStatus::Success, &route);

        Ok(Delivery::succeeded(payload, data).with_header("routing_key", route))
    }
}

#[async_trait]
impl<T: BrokerTransport> Listener for BrokerDriver<T> {
    type Message = InboundMessage;

    fn configure(
        &self,
        action: Arc<dyn Action<InboundMessage>>,
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
            "listening for inbound messages"
        );

        let mut deliveries = self.transport.consume().await?;

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(driver = %self.name, "broker listener shutting down");
                    return Ok(());
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.handle(delivery, binding).await?,
                Some(Err(err)) => {
                    tracing::error!(
                        driver = %self.name,
                        error = %err,
                        "inbound stream failed"
                    );
                    return Err(err);
                }
                None => {
                    tracing::warn!(driver = %self.name, "inbound stream closed");
                    return Ok(());
                }
            }
        }
    }
}
