//! Prometheus job counter for payler workflows.
//!
//! One counter is exposed:
//!
//! ```text
//! # HELP payler_workflow_jobs_total Count number of payler-processed jobs.
//! # TYPE payler_workflow_jobs_total counter
//! payler_workflow_jobs_total{status="success",workflow="BrokerManager"} 1
//! payler_workflow_jobs_total{status="failed",workflow="SpoolManager"} 1
//! ```
//!
//! The counter is built once at process start and handed to every driver.
//! Serving it over HTTP is left to an external exporter, which can read the
//! registry or call [`JobCounter::gather`].

use std::fmt;

use prometheus::{IntCounterVec, Opts, Registry};

use crate::error::Result;

/// Full metric name as exposed, `_total` suffix included.
pub const METRIC_NAME: &str = "payler_workflow_jobs_total";
const DESCRIPTION: &str = "Count number of payler-processed jobs.";

/// Terminal outcome of a processed job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum JobStatus {
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide counter of processed jobs labeled by workflow and status.
///
/// Cloning is cheap and every clone updates the same atomic counters.
#[derive(Clone)]
pub struct JobCounter {
    registry: Registry,
    jobs: IntCounterVec,
}

impl JobCounter {
    /// Create a counter registered in a fresh registry.
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create a counter registered in `registry`.
    ///
    /// Fails when the registry already holds a collector with the same name.
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let jobs = IntCounterVec::new(
            Opts::new(METRIC_NAME, DESCRIPTION),
            &["workflow", "status"],
        )?;
        registry.register(Box::new(jobs.clone()))?;
        Ok(Self { registry, jobs })
    }

    /// Increment the counter for `(workflow, status)` by one.
    pub fn record(&self, workflow: &str, status: JobStatus) {
        self.jobs
            .with_label_values(&[workflow, status.as_str()])
            .inc();
    }

    /// Current value for `(workflow, status)`.
    pub fn get(&self, workflow: &str, status: JobStatus) -> u64 {
        self.jobs
            .with_label_values(&[workflow, status.as_str()])
            .get()
    }

    /// Registry the counter lives in.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in Prometheus text format.
    pub fn gather(&self) -> anyhow::Result<String> {
        let encoder = prometheus::TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode_to_string(&families).map_err(Into::into)
    }
}

impl fmt::Debug for JobCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobCounter")
            .field("metric", &METRIC_NAME)
            .finish()
    }
}
