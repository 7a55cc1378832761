//! NATS JetStream transport for the broker driver.
//!
//! The inbound queue is a JetStream stream capturing `queue_subject`, read
//! through a durable pull consumer with explicit acknowledgement. Publishing
//! goes through JetStream so `process` returns the server's ack. Routes that
//! no stream captures, such as the default `payloads` subject, fall back to a
//! core NATS publish and reach plain subscribers without an ack.

use std::collections::BTreeMap;

use async_nats::connection::State;
use async_nats::jetstream::consumer::{pull, AckPolicy, PullConsumer};
use async_nats::jetstream::context::PublishErrorKind;
use async_nats::jetstream::{self, stream, AckKind};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use super::{
    Acknowledger, BrokerDriver, BrokerTransport, Deliveries, InboundDelivery,
    InboundMessage, DELAY_HEADER, DESTINATION_HEADER,
};
use crate::config::{BrokerOptions, DriverConfiguration};
use crate::driver::DeliveryData;
use crate::error::{PaylerError, Result};
use crate::metrics::JobCounter;

/// JetStream-backed [`BrokerTransport`].
#[derive(Clone, Debug)]
pub struct NatsTransport {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    options: BrokerOptions,
}

impl NatsTransport {
    /// Connect to the NATS server at `url`.
    pub async fn connect(url: &str, options: BrokerOptions) -> Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .name("payler")
            .connection_timeout(options.connect_timeout())
            .connect(url)
            .await
            .map_err(|e| {
                PaylerError::backend(
                    anyhow::Error::new(e).context("connecting to NATS"),
                )
            })?;
        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            options,
        })
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    async fn publish_core(
        &self,
        route: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<DeliveryData> {
        tracing::debug!(
            route = %route,
            "no stream captures route, publishing on core NATS"
        );
        self.client
            .publish_with_headers(route.to_string(), headers, body)
            .await
            .map_err(|e| publish_failed(route, e))?;
        self.client
            .flush()
            .await
            .map_err(|e| publish_failed(route, e))?;
        Ok(DeliveryData::Sent {
            route: route.to_string(),
        })
    }

    fn stream_config(&self) -> stream::Config {
        stream::Config {
            name: self.options.stream.clone(),
            subjects: vec![self.options.queue_subject.clone()],
            ..Default::default()
        }
    }

    async fn consumer(&self) -> Result<PullConsumer> {
        let stream = self
            .jetstream
            .get_or_create_stream(self.stream_config())
            .await
            .map_err(|e| {
                PaylerError::backend(anyhow::Error::new(e).context(format!(
                    "getting stream {}",
                    self.options.stream
                )))
            })?;

        stream
            .get_or_create_consumer(
                &self.options.consumer_name,
                pull::Config {
                    durable_name: Some(self.options.consumer_name.clone()),
                    filter_subject: self.options.queue_subject.clone(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                PaylerError::backend(anyhow::Error::new(e).context(format!(
                    "creating consumer {}",
                    self.options.consumer_name
                )))
            })
    }
}

fn publish_failed(route: &str, err: impl Into<anyhow::Error>) -> PaylerError {
    PaylerError::backend(err.into().context(format!("publishing to {route}")))
}

fn into_delivery(message: jetstream::Message) -> InboundDelivery {
    let mut headers = BTreeMap::new();
    if let Some(map) = message.headers.as_ref() {
        for name in [DELAY_HEADER, DESTINATION_HEADER] {
            if let Some(value) = map.get(name) {
                headers.insert(name.to_string(), value.as_str().to_string());
            }
        }
    }

    let inbound = InboundMessage {
        subject: message.subject.to_string(),
        body: message.payload.clone(),
        headers,
    };
    InboundDelivery::new(inbound, Box::new(NatsAcker { message }))
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acknowledger for NatsAcker {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| PaylerError::backend(anyhow::anyhow!("ack failed: {e}")))
    }

    async fn nak(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| PaylerError::backend(anyhow::anyhow!("nak failed: {e}")))
    }
}

#[async_trait]
impl BrokerTransport for NatsTransport {
    async fn declare(&self) -> Result<String> {
        let stream = self
            .jetstream
            .get_or_create_stream(self.stream_config())
            .await
            .map_err(PaylerError::setup)?;
        Ok(stream.cached_info().config.name.clone())
    }

    async fn is_ready(&self) -> bool {
        matches!(self.client.connection_state(), State::Connected)
    }

    async fn publish(
        &self,
        route: &str,
        headers: &BTreeMap<String, String>,
        body: Bytes,
    ) -> Result<DeliveryData> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(name.as_str(), value.as_str());
        }

        let acked = match self
            .jetstream
            .publish_with_headers(route.to_string(), map.clone(), body.clone())
            .await
        {
            Ok(ack) => ack.await,
            Err(e) => Err(e),
        };

        match acked {
            Ok(ack) => Ok(DeliveryData::Published {
                stream: ack.stream,
                sequence: ack.sequence,
                duplicate: ack.duplicate,
            }),
            Err(e) if matches!(e.kind(), PublishErrorKind::StreamNotFound) => {
                self.publish_core(route, map, body).await
            }
            Err(e) => Err(publish_failed(route, e)),
        }
    }

    async fn consume(&self) -> Result<Deliveries> {
        let messages = self.consumer().await?.messages().await.map_err(|e| {
            PaylerError::backend(
                anyhow::Error::new(e).context("opening message stream"),
            )
        })?;

        Ok(messages
            .map(|item| match item {
                Ok(message) => Ok(into_delivery(message)),
                Err(e) => Err(PaylerError::backend(
                    anyhow::Error::new(e).context("receiving message"),
                )),
            })
            .boxed())
    }
}

impl BrokerDriver<NatsTransport> {
    /// Connect a broker driver from its configuration.
    pub async fn connect(
        config: DriverConfiguration<BrokerOptions>,
        metrics: JobCounter,
    ) -> Result<Self> {
        let transport =
            NatsTransport::connect(&config.url, config.extra.clone()).await?;
        Ok(Self::new(config.name, transport, &config.extra, metrics))
    }
}
