use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use payler::broker::{
    Acknowledger, BrokerTransport, Deliveries, InboundDelivery, InboundMessage,
};
use payler::{DeliveryData, PaylerError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;

const STREAM: &str = "MEMORY";

/// A message handed to [`BrokerTransport::publish`].
#[derive(Clone, Debug, PartialEq)]
pub struct PublishedMessage {
    pub route: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

/// Broker transport kept in memory.
///
/// Inbound messages are pushed by the test and consumed once through
/// [`BrokerTransport::consume`]. Acks, naks and publishes are recorded.
/// Clones share state.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

struct BrokerState {
    sender: Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    published: Mutex<Vec<PublishedMessage>>,
    acked: Mutex<Vec<InboundMessage>>,
    nacked: Mutex<Vec<InboundMessage>>,
    unroutable: Mutex<BTreeSet<String>>,
    failing: Mutex<bool>,
    connected: Mutex<bool>,
    declared: Mutex<usize>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(BrokerState {
                sender: Mutex::new(Some(sender)),
                receiver: Mutex::new(Some(receiver)),
                published: Mutex::new(Vec::new()),
                acked: Mutex::new(Vec::new()),
                nacked: Mutex::new(Vec::new()),
                unroutable: Mutex::new(BTreeSet::new()),
                failing: Mutex::new(false),
                connected: Mutex::new(true),
                declared: Mutex::new(0),
            }),
        }
    }

    /// Queue a message for the consumer. Ignored once the inbound side closed.
    pub fn push_inbound(&self, message: InboundMessage) {
        if let Some(sender) = self.state.sender.lock().as_ref() {
            let _ = sender.send(message);
        }
    }

    /// End the inbound stream once queued messages are drained.
    pub fn close_inbound(&self) {
        self.state.sender.lock().take();
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().clone()
    }

    pub fn acked(&self) -> Vec<InboundMessage> {
        self.state.acked.lock().clone()
    }

    pub fn nacked(&self) -> Vec<InboundMessage> {
        self.state.nacked.lock().clone()
    }

    pub fn declared(&self) -> usize {
        *self.state.declared.lock()
    }

    /// Reject publishes to `route` as unroutable.
    pub fn mark_unroutable(&self, route: impl Into<String>) {
        self.state.unroutable.lock().insert(route.into());
    }

    pub fn clear_unroutable(&self) {
        self.state.unroutable.lock().clear();
    }

    /// Make publishes fail with a backend error.
    pub fn set_failing(&self, failing: bool) {
        *self.state.failing.lock() = failing;
    }

    pub fn set_connected(&self, connected: bool) {
        *self.state.connected.lock() = connected;
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryAcker {
    state: Arc<BrokerState>,
    message: InboundMessage,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.state.acked.lock().push(self.message.clone());
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        self.state.nacked.lock().push(self.message.clone());
        if let Some(sender) = self.state.sender.lock().as_ref() {
            let _ = sender.send(self.message.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn declare(&self) -> Result<String> {
        *self.state.declared.lock() += 1;
        Ok(STREAM.to_string())
    }

    async fn is_ready(&self) -> bool {
        *self.state.connected.lock()
    }

    async fn publish(
        &self,
        route: &str,
        headers: &BTreeMap<String, String>,
        body: Bytes,
    ) -> Result<DeliveryData> {
        if *self.state.failing.lock() {
            return Err(PaylerError::backend(anyhow::anyhow!(
                "publishing to {route}: connection closed"
            )));
        }
        if self.state.unroutable.lock().contains(route) {
            return Err(PaylerError::processing(format!(
                "no stream bound to route {route}"
            )));
        }

        let mut published = self.state.published.lock();
        published.push(PublishedMessage {
            route: route.to_string(),
            headers: headers.clone(),
            body,
        });
        Ok(DeliveryData::Published {
            stream: STREAM.to_string(),
            sequence: published.len() as u64,
            duplicate: false,
        })
    }

    async fn consume(&self) -> Result<Deliveries> {
        let receiver = self.state.receiver.lock().take().ok_or_else(|| {
            PaylerError::backend(anyhow::anyhow!("inbound queue already consumed"))
        })?;
        let state = Arc::clone(&self.state);

        let messages = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|message| (message, receiver))
        });

        Ok(messages
            .map(move |message| {
                let acker = MemoryAcker {
                    state: Arc::clone(&state),
                    message: message.clone(),
                };
                Ok(InboundDelivery::new(message, Box::new(acker)))
            })
            .boxed())
    }
}
