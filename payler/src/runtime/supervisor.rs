use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::registry::ActionRegistry;
use super::workflow::{register_workflows, Workflow};
use crate::config::PaylerConfig;
use crate::error::{PaylerError, Result};
use crate::metrics::JobCounter;

/// How long `shutdown` waits for each workflow task to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Cancellation signal shared by every workflow of a runtime.
///
/// Clones observe the same state; once cancelled a token stays cancelled.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    state: Arc<watch::Sender<bool>>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolve once [`ShutdownToken::cancel`] has been called on any clone.
    pub async fn cancelled(&self) {
        let mut state = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = state.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// How one workflow task ended.
#[derive(Debug)]
pub struct WorkflowExit {
    pub name: String,
    pub result: Result<()>,
}

impl WorkflowExit {
    async fn join(name: String, handle: JoinHandle<Result<()>>) -> Self {
        let result = handle.await.unwrap_or_else(|e| {
            Err(PaylerError::backend(
                anyhow::Error::new(e).context("workflow task aborted"),
            ))
        });
        Self { name, result }
    }
}

/// Runs a set of workflows concurrently on the tokio runtime.
///
/// A workflow that fails only ends its own task; the others keep running
/// until they fail too or [`WorkflowRuntime::shutdown`] is called. A
/// [`PaylerError::Setup`] failure is the exception: the backend could not be
/// prepared, so [`WorkflowRuntime::wait`] cancels every other workflow.
pub struct WorkflowRuntime {
    settings: Arc<PaylerConfig>,
    metrics: JobCounter,
    shutdown_token: ShutdownToken,
    workflows: Mutex<Vec<Workflow>>,
    handles: Mutex<Vec<(String, JoinHandle<Result<()>>)>>,
}

impl WorkflowRuntime {
    pub fn new(
        settings: PaylerConfig,
        workflows: Vec<Workflow>,
        metrics: JobCounter,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            metrics,
            shutdown_token: ShutdownToken::new(),
            workflows: Mutex::new(workflows),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Resolve the configured workflows against `registry`.
    ///
    /// Fails with [`PaylerError::Resolution`] before anything runs when a
    /// callable is unknown.
    pub fn from_config(
        settings: PaylerConfig,
        registry: &ActionRegistry,
        metrics: JobCounter,
    ) -> Result<Self> {
        let workflows = register_workflows(&settings.workflows, registry)?;
        Ok(Self::new(settings, workflows, metrics))
    }

    /// Get a clone of the shutdown token.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    pub fn metrics(&self) -> &JobCounter {
        &self.metrics
    }

    pub fn settings(&self) -> &PaylerConfig {
        &self.settings
    }

    /// Start every workflow that is not running yet.
    pub async fn start(&self) -> Result<()> {
        let mut workflows = self.workflows.lock().await;
        let mut handles = self.handles.lock().await;
        let mut started = 0;

        for workflow in workflows.iter_mut().filter(|w| !w.is_started()) {
            workflow.start(
                Arc::clone(&self.settings),
                self.metrics.clone(),
                self.shutdown_token.clone(),
            );
            if let Some(handle) = workflow.take_handle() {
                handles.push((workflow.name().to_string(), handle));
                started += 1;
            }
        }

        tracing::info!(
            started,
            running = handles.len(),
            "workflow runtime started"
        );
        Ok(())
    }

    /// Wait until every started workflow has ended.
    ///
    /// Failures are logged as they happen. Only a setup failure stops the
    /// others, by cancelling the shared shutdown token.
    pub async fn wait(&self) -> Vec<WorkflowExit> {
        let handles = self.take_handles().await;

        let mut running: FuturesUnordered<_> = handles
            .into_iter()
            .map(|(name, handle)| WorkflowExit::join(name, handle))
            .collect();

        let mut exits = Vec::new();
        while let Some(exit) = running.next().await {
            match &exit.result {
                Ok(()) => tracing::info!(workflow = %exit.name, "workflow finished"),
                Err(err @ PaylerError::Setup(_)) => {
                    tracing::error!(
                        workflow = %exit.name,
                        error = %err,
                        "workflow setup failed, stopping all workflows"
                    );
                    self.shutdown_token.cancel();
                }
                Err(err) => tracing::error!(
                    workflow = %exit.name,
                    error = %err,
                    "workflow failed"
                ),
            }
            exits.push(exit);
        }
        exits
    }

    /// Cancel every workflow and wait up to 30 seconds for each to end.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("shutting down workflow runtime");
        self.shutdown_token.cancel();

        let handles = self.take_handles().await;
        let mut stopping: FuturesUnordered<_> = handles
            .into_iter()
            .map(|(name, handle)| async move {
                let exit = WorkflowExit::join(name.clone(), handle);
                (name, tokio::time::timeout(SHUTDOWN_GRACE, exit).await)
            })
            .collect();

        while let Some((name, outcome)) = stopping.next().await {
            match outcome {
                Ok(WorkflowExit { result: Ok(()), .. }) => {}
                Ok(WorkflowExit { result: Err(err), .. }) => {
                    tracing::warn!(workflow = %name, error = %err, "workflow ended with error")
                }
                Err(_) => {
                    tracing::warn!(workflow = %name, "workflow did not stop in time")
                }
            }
        }

        tracing::info!("workflow runtime stopped");
        Ok(())
    }

    async fn take_handles(&self) -> Vec<(String, JoinHandle<Result<()>>)> {
        std::mem::take(&mut *self.handles.lock().await)
    }
}

impl std::fmt::Debug for WorkflowRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRuntime")
            .field("shutdown_token", &self.shutdown_token)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::runtime::WorkflowContext;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    async fn until_cancelled(ctx: WorkflowContext) -> Result<()> {
        ctx.shutdown.cancelled().await;
        Ok(())
    }

    async fn fail_fast(_ctx: WorkflowContext) -> Result<()> {
        Err(PaylerError::backend(anyhow::anyhow!("connection refused")))
    }

    async fn setup_rejected(_ctx: WorkflowContext) -> Result<()> {
        Err(PaylerError::setup(anyhow::anyhow!("index creation refused")))
    }

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry
            .register("test.until_cancelled", until_cancelled)
            .register("test.fail_fast", fail_fast)
            .register("test.setup_rejected", setup_rejected);
        registry
    }

    fn runtime(workflows: &[(&str, &str)]) -> WorkflowRuntime {
        runtime_with(&registry(), workflows)
    }

    fn runtime_with(
        registry: &ActionRegistry,
        workflows: &[(&str, &str)],
    ) -> WorkflowRuntime {
        let settings = PaylerConfig {
            workflows: workflows
                .iter()
                .map(|(name, callable)| WorkflowConfig::new(*name, *callable))
                .collect(),
            ..PaylerConfig::default()
        };
        WorkflowRuntime::from_config(settings, registry, JobCounter::new().unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn test_runtime_shutdown_wakes_workflows() {
        let runtime = runtime(&[
            ("a", "test.until_cancelled"),
            ("b", "test.until_cancelled"),
        ]);
        runtime.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = timeout(Duration::from_secs(5), runtime.shutdown()).await;
        assert!(result.is_ok(), "shutdown did not complete within 5 seconds");
        result.unwrap().expect("shutdown returned error");
    }

    #[tokio::test]
    async fn test_failed_workflow_does_not_stop_others() {
        let runtime = runtime(&[
            ("steady", "test.until_cancelled"),
            ("broken", "test.fail_fast"),
        ]);
        runtime.start().await.unwrap();
        let token = runtime.shutdown_token();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let exits = timeout(Duration::from_secs(5), runtime.wait())
            .await
            .expect("workflows did not end");
        canceller.await.unwrap();

        assert_eq!(exits.len(), 2);
        assert_eq!(exits[0].name, "broken");
        assert!(matches!(exits[0].result, Err(PaylerError::Backend(_))));
        assert_eq!(exits[1].name, "steady");
        assert!(exits[1].result.is_ok());
    }

    #[tokio::test]
    async fn test_start_twice_spawns_each_workflow_once() {
        let entries = Arc::new(AtomicUsize::new(0));
        let mut registry = registry();
        registry.register("test.counted", {
            let entries = Arc::clone(&entries);
            move |ctx: WorkflowContext| {
                entries.fetch_add(1, Ordering::SeqCst);
                until_cancelled(ctx)
            }
        });
        let runtime = runtime_with(&registry, &[("counted", "test.counted")]);

        runtime.start().await.unwrap();
        runtime.start().await.unwrap();
        runtime.shutdown_token().cancel();
        let exits = timeout(Duration::from_secs(5), runtime.wait())
            .await
            .expect("workflow did not end");

        assert_eq!(entries.load(Ordering::SeqCst), 1);
        assert_eq!(exits.len(), 1);
    }

    #[tokio::test]
    async fn test_setup_failure_stops_every_workflow() {
        let runtime = runtime(&[
            ("steady", "test.until_cancelled"),
            ("store", "test.setup_rejected"),
        ]);
        runtime.start().await.unwrap();

        let exits = timeout(Duration::from_millis(500), runtime.wait())
            .await
            .expect("setup failure did not stop the runtime");

        assert!(runtime.shutdown_token().is_cancelled());
        assert_eq!(exits[0].name, "store");
        assert!(matches!(exits[0].result, Err(PaylerError::Setup(_))));
        assert_eq!(exits[1].name, "steady");
        assert!(exits[1].result.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_ends_workflows_at_once() {
        let runtime = runtime(&[("late", "test.until_cancelled")]);
        let token = runtime.shutdown_token();
        token.cancel();

        runtime.start().await.unwrap();
        let exits = timeout(Duration::from_secs(1), runtime.wait())
            .await
            .expect("workflow missed an earlier cancellation");

        assert_eq!(exits.len(), 1);
        assert!(exits[0].result.is_ok());
    }
}
