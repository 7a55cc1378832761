use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::Instrument;

use super::registry::{ActionRegistry, WorkflowFn};
use super::supervisor::ShutdownToken;
use crate::config::{PaylerConfig, WorkflowConfig};
use crate::error::Result;
use crate::metrics::JobCounter;
use crate::telemetry::workflow_span;

/// Everything a workflow entry point receives when started.
#[derive(Clone, Debug)]
pub struct WorkflowContext {
    /// Workflow name; pipelines use it as their metrics label.
    pub name: String,
    pub settings: Arc<PaylerConfig>,
    pub metrics: JobCounter,
    pub shutdown: ShutdownToken,
}

/// A resolved workflow, started at most once.
pub struct Workflow {
    name: String,
    callable: String,
    entry: WorkflowFn,
    started: bool,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Workflow {
    pub fn new(
        name: impl Into<String>,
        callable: impl Into<String>,
        entry: WorkflowFn,
    ) -> Self {
        Self {
            name: name.into(),
            callable: callable.into(),
            entry,
            started: false,
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn callable(&self) -> &str {
        &self.callable
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Spawn the entry point as an independent task.
    ///
    /// Starting an already started workflow does nothing.
    pub fn start(
        &mut self,
        settings: Arc<PaylerConfig>,
        metrics: JobCounter,
        shutdown: ShutdownToken,
    ) {
        if self.started {
            tracing::warn!(workflow = %self.name, "workflow already started");
            return;
        }

        tracing::info!(
            workflow = %self.name,
            callable = %self.callable,
            "starting workflow"
        );
        let ctx = WorkflowContext {
            name: self.name.clone(),
            settings,
            metrics,
            shutdown,
        };
        let future = (self.entry)(ctx).instrument(workflow_span(&self.name));
        self.handle = Some(tokio::spawn(future));
        self.started = true;
    }

    /// Hand over the task handle. The workflow stays started.
    pub fn take_handle(&mut self) -> Option<JoinHandle<Result<()>>> {
        self.handle.take()
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("callable", &self.callable)
            .field("started", &self.started)
            .finish()
    }
}

/// Resolve every configured workflow, in order, without starting any.
///
/// The first unresolvable callable aborts the whole registration.
pub fn register_workflows(
    configs: &[WorkflowConfig],
    registry: &ActionRegistry,
) -> Result<Vec<Workflow>> {
    configs
        .iter()
        .map(|config| {
            let entry = registry.resolve(&config.callable)?;
            tracing::debug!(
                workflow = %config.name,
                callable = %config.callable,
                "workflow registered"
            );
            Ok(Workflow::new(&config.name, &config.callable, entry))
        })
        .collect()
}
