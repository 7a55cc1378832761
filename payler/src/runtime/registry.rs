use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::workflow::WorkflowContext;
use crate::error::{PaylerError, Result};

/// Entry point of a workflow, as stored in the [`ActionRegistry`].
pub type WorkflowFn =
    Arc<dyn Fn(WorkflowContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Maps `module.attribute` locations to workflow entry points.
///
/// Populated once at startup; workflow configuration then refers to entries
/// by location, e.g. `client.process_queue`.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    entries: BTreeMap<String, WorkflowFn>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in pipelines.
    #[cfg(all(feature = "nats", feature = "postgres"))]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        crate::pipelines::register_defaults(&mut registry);
        registry
    }

    /// Register `entry` under `location`, replacing any previous entry.
    pub fn register<F, Fut>(
        &mut self,
        location: impl Into<String>,
        entry: F,
    ) -> &mut Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let entry: WorkflowFn = Arc::new(move |ctx| entry(ctx).boxed());
        self.entries.insert(location.into(), entry);
        self
    }

    /// Look up a dotted location such as `client.watch_storage`.
    pub fn resolve(&self, location: &str) -> Result<WorkflowFn> {
        let Some((module, name)) = location.rsplit_once('.') else {
            return Err(PaylerError::Resolution(location.to_string()));
        };
        self.resolve_action(module, name)
    }

    /// Look up `name` inside `module`.
    pub fn resolve_action(&self, module: &str, name: &str) -> Result<WorkflowFn> {
        let location = format!("{module}.{name}");
        self.entries
            .get(&location)
            .cloned()
            .ok_or(PaylerError::Resolution(location))
    }

    pub fn contains(&self, location: &str) -> bool {
        self.entries.contains_key(location)
    }

    /// Registered locations, sorted.
    pub fn locations(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("locations", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}
