//! The capability contract every backend adapter implements.
//!
//! A [`Driver`] is a sink: it can be prepared, probed and asked to durably
//! hand off one [`Payload`]. A [`Listener`] is additionally a source: once
//! bound to an [`Action`] and a downstream driver it runs a long-lived loop
//! feeding its native messages through that action.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{PaylerError, Result};
use crate::payload::Payload;
use crate::runtime::ShutdownToken;

#[async_trait]
pub trait Driver: Send + Sync {
    /// Logical instance name, used as the metrics label for `process`.
    fn name(&self) -> &str;

    /// Idempotent one-time preparation of the backend.
    ///
    /// Returns an identifier of the prepared resource (index, stream).
    async fn setup(&self) -> Result<String>;

    /// Lightweight liveness probe. Never mutates backend state.
    async fn is_reachable(&self) -> bool;

    /// Durably hand off one payload. Safe to call concurrently.
    async fn process(
        &self,
        payload: Payload,
        options: &ProcessOptions,
    ) -> Result<Delivery>;
}

#[async_trait]
pub trait Listener: Driver {
    /// Native unit the listen loop hands to its action.
    type Message: Send + Sync + 'static;

    /// Bind the per-message action and the driver it may call into.
    ///
    /// Must be called exactly once, before [`Listener::listen`].
    fn configure(
        &self,
        action: Arc<dyn Action<Self::Message>>,
        downstream: Arc<dyn Driver>,
        options: ListenOptions,
    ) -> Result<()>;

    /// Run the source loop until `shutdown` fires or the backend fails.
    async fn listen(&self, shutdown: ShutdownToken) -> Result<()>;
}

/// Translation from one driver's native message to another driver's sink.
#[async_trait]
pub trait Action<M>: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, message: &M, downstream: &dyn Driver)
        -> Result<Delivery>;
}

/// Per-call options for [`Driver::process`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProcessOptions {
    /// Route to publish to; drivers fall back to their configured default.
    pub routing_key: Option<String>,
}

impl ProcessOptions {
    pub fn routed(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: Some(routing_key.into()),
        }
    }
}

/// Options fixed at [`Listener::configure`] time.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ListenOptions {
    /// Metrics label for action outcomes; defaults to the driver name.
    pub label: Option<String>,
}

impl ListenOptions {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
        }
    }
}

/// Immutable result of [`Listener::configure`].
pub struct Binding<M> {
    pub action: Arc<dyn Action<M>>,
    pub downstream: Arc<dyn Driver>,
    pub options: ListenOptions,
}

impl<M> Binding<M> {
    /// Label under which action outcomes are counted.
    pub fn label<'a>(&'a self, driver_name: &'a str) -> &'a str {
        self.options.label.as_deref().unwrap_or(driver_name)
    }
}

impl<M> fmt::Debug for Binding<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("action", &self.action.name())
            .field("downstream", &self.downstream.name())
            .field("options", &self.options)
            .finish()
    }
}

/// Write-once slot holding a listener's [`Binding`].
pub(crate) struct BindingSlot<M> {
    slot: std::sync::OnceLock<Binding<M>>,
}

impl<M> BindingSlot<M> {
    pub(crate) fn new() -> Self {
        Self {
            slot: std::sync::OnceLock::new(),
        }
    }

    pub(crate) fn bind(&self, driver: &str, binding: Binding<M>) -> Result<()> {
        self.slot
            .set(binding)
            .map_err(|_| PaylerError::AlreadyConfigured(driver.to_string()))
    }

    pub(crate) fn get(&self, driver: &str) -> Result<&Binding<M>> {
        self.slot
            .get()
            .ok_or_else(|| PaylerError::NotConfigured(driver.to_string()))
    }
}

/// Outcome of a [`Driver::process`] call.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub success: bool,
    /// Free-form metadata such as the storage location or route.
    pub headers: BTreeMap<String, String>,
    /// The payload acted upon.
    pub payload: Payload,
    /// Backend-specific raw result.
    pub data: DeliveryData,
}

impl Delivery {
    pub fn succeeded(payload: Payload, data: DeliveryData) -> Self {
        Self {
            success: true,
            headers: BTreeMap::new(),
            payload,
            data,
        }
    }

    pub fn with_header(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeliveryData {
    /// Document written by a store; carries the generated id.
    Inserted { id: Uuid },
    /// Message accepted by a broker.
    Published {
        stream: String,
        sequence: u64,
        duplicate: bool,
    },
    /// Message sent on a plain subject that no stream captures; not acked.
    Sent { route: String },
    /// Payload kept by an in-process sink at the given position.
    Recorded { index: usize },
}
