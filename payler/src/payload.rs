use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{PaylerError, Result};

/// The unit of delayed delivery: message bytes plus timing and routing.
///
/// Payloads are immutable once built. The message body is never inspected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    message: Bytes,
    release_at: DateTime<Utc>,
    source: String,
    destination: String,
}

impl Payload {
    /// Build a payload, rejecting empty routing identifiers.
    ///
    /// `release_at` may lie in the past, in which case the payload is
    /// immediately eligible for replay.
    pub fn new(
        message: impl Into<Bytes>,
        release_at: DateTime<Utc>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Result<Self> {
        let source = source.into();
        let destination = destination.into();
        if source.trim().is_empty() {
            return Err(PaylerError::processing("payload source is empty"));
        }
        if destination.trim().is_empty() {
            return Err(PaylerError::processing(
                "payload destination is empty",
            ));
        }
        Ok(Self {
            message: message.into(),
            release_at,
            source,
            destination,
        })
    }

    pub fn message(&self) -> &Bytes {
        &self.message
    }

    pub fn release_at(&self) -> DateTime<Utc> {
        self.release_at
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Whether the payload may be replayed at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.release_at <= now
    }
}
