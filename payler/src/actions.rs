//! Actions bridging the two drivers.
//!
//! [`SpoolAction`] turns an inbound broker message into a stored payload;
//! [`ReplayAction`] turns a due document back into a broker publish.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use crate::broker::{InboundMessage, DELAY_HEADER, DESTINATION_HEADER};
use crate::clock::{Clock, SystemClock};
use crate::driver::{Action, Delivery, Driver, ProcessOptions};
use crate::error::{PaylerError, Result};
use crate::payload::Payload;
use crate::store::StoredDocument;

/// Parse the `x-delay` header value, in microseconds.
pub fn parse_delay(raw: &str) -> Result<Duration> {
    let micros: i64 = raw.trim().parse().map_err(|_| {
        PaylerError::processing(format!("invalid {DELAY_HEADER} header {raw:?}"))
    })?;
    if micros < 0 {
        return Err(PaylerError::processing(format!(
            "negative {DELAY_HEADER} header {raw:?}"
        )));
    }
    Ok(Duration::microseconds(micros))
}

/// Spools a delayed broker message into the downstream store.
#[derive(Debug)]
pub struct SpoolAction {
    clock: Arc<dyn Clock>,
    default_destination: String,
}

impl SpoolAction {
    pub fn new(default_destination: impl Into<String>) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            default_destination: default_destination.into(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the payload an inbound message asks to be delayed.
    pub fn payload_for(&self, message: &InboundMessage) -> Result<Payload> {
        let raw = message.header(DELAY_HEADER).ok_or_else(|| {
            PaylerError::processing(format!("missing {DELAY_HEADER} header"))
        })?;
        let delay = parse_delay(raw)?;
        let release_at = self
            .clock
            .now()
            .checked_add_signed(delay)
            .ok_or_else(|| PaylerError::processing("release time out of range"))?;

        let destination = message
            .header(DESTINATION_HEADER)
            .unwrap_or(self.default_destination.as_str());

        Payload::new(
            message.body.clone(),
            release_at,
            message.subject.as_str(),
            destination,
        )
    }
}

#[async_trait]
impl Action<InboundMessage> for SpoolAction {
    fn name(&self) -> &str {
        "spool"
    }

    async fn call(
        &self,
        message: &InboundMessage,
        downstream: &dyn Driver,
    ) -> Result<Delivery> {
        let payload = self.payload_for(message)?;
        tracing::debug!(
            subject = %message.subject,
            release_at = %payload.release_at(),
            destination = %payload.destination(),
            "spooling message"
        );
        downstream.process(payload, &ProcessOptions::default()).await
    }
}

/// Publishes a due document to its destination route.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplayAction;

#[async_trait]
impl Action<StoredDocument> for ReplayAction {
    fn name(&self) -> &str {
        "replay"
    }

    async fn call(
        &self,
        message: &StoredDocument,
        downstream: &dyn Driver,
    ) -> Result<Delivery> {
        let payload = message.to_payload()?;
        let options = ProcessOptions::routed(payload.destination());
        downstream.process(payload, &options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn delay_is_microseconds() {
        assert_eq!(parse_delay("10000").unwrap(), Duration::milliseconds(10));
        assert_eq!(parse_delay(" 0 ").unwrap(), Duration::zero());
    }

    #[test]
    fn bad_delays_are_processing_errors() {
        for raw in ["", "soon", "1.5", "-1"] {
            let err = parse_delay(raw).unwrap_err();
            assert!(err.is_recoverable(), "{raw:?} gave {err}");
        }
    }

    #[test]
    fn payload_uses_headers_and_subject() {
        let clock = Arc::new(ManualClock::default());
        let action = SpoolAction::new("payloads").with_clock(clock.clone());
        let message = InboundMessage::new("payler-jobs", r#"{"ID":332,"message":"hi"}"#)
            .with_header(DELAY_HEADER, "10000")
            .with_header(DESTINATION_HEADER, "replies");

        let payload = action.payload_for(&message).unwrap();

        assert_eq!(payload.release_at(), clock.now() + Duration::milliseconds(10));
        assert_eq!(payload.source(), "payler-jobs");
        assert_eq!(payload.destination(), "replies");
        assert_eq!(payload.message(), &message.body);
    }

    #[test]
    fn destination_falls_back_to_default() {
        let action = SpoolAction::new("payloads");
        let message = InboundMessage::new("payler-jobs", "x").with_header(DELAY_HEADER, "1");

        assert_eq!(action.payload_for(&message).unwrap().destination(), "payloads");
    }

    #[test]
    fn missing_delay_is_rejected() {
        let action = SpoolAction::new("payloads");
        let err = action
            .payload_for(&InboundMessage::new("payler-jobs", "x"))
            .unwrap_err();
        assert!(matches!(err, PaylerError::Processing(_)));
    }

    struct Unreachable;

    #[async_trait]
    impl Driver for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn setup(&self) -> Result<String> {
            Err(PaylerError::setup(anyhow::anyhow!("not used")))
        }

        async fn is_reachable(&self) -> bool {
            false
        }

        async fn process(
            &self,
            _payload: Payload,
            _options: &ProcessOptions,
        ) -> Result<Delivery> {
            panic!("replay must fail before publishing")
        }
    }

    #[tokio::test]
    async fn replay_requires_routing_fields() {
        let doc = StoredDocument {
            id: Uuid::new_v4(),
            message: b"x".to_vec(),
            reference_date: Utc::now(),
            source: Some("in".into()),
            destination: None,
        };

        let err = ReplayAction.call(&doc, &Unreachable).await.unwrap_err();

        assert!(err.is_recoverable());
    }
}
