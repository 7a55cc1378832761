//! Tracing spans and outcome recording for payler pipelines.
//!
//! Drivers never talk to the metrics counter directly; they go through
//! [`record_job_outcome`] so every counted outcome also leaves a log line.

use std::future::Future;

use tracing::{info_span, Instrument, Span};

use crate::metrics::{JobCounter, JobStatus};

/// Span covering the whole lifetime of one workflow task.
#[must_use]
pub fn workflow_span(name: impl AsRef<str>) -> Span {
    info_span!("payler.workflow", workflow = %name.as_ref())
}

/// Span covering one action invocation inside a listen loop.
///
/// `reference` identifies the message or document being handled.
#[must_use]
pub fn dispatch_span(
    driver: impl AsRef<str>,
    reference: impl AsRef<str>,
) -> Span {
    info_span!(
        "payler.dispatch",
        driver = %driver.as_ref(),
        reference = %reference.as_ref(),
    )
}

/// Span covering one query-and-dispatch pass of the store poller.
#[must_use]
pub fn poll_pass_span(driver: impl AsRef<str>) -> Span {
    info_span!("payler.poll", driver = %driver.as_ref())
}

/// Attach a dispatch span to a future.
pub fn instrument_dispatch<F>(
    driver: impl AsRef<str>,
    reference: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(dispatch_span(driver, reference))
}

/// Count a job outcome and log it.
pub fn record_job_outcome(
    metrics: &JobCounter,
    workflow: impl AsRef<str>,
    status: JobStatus,
    reference: impl AsRef<str>,
) {
    tracing::debug!(
        workflow = %workflow.as_ref(),
        status = %status,
        reference = %reference.as_ref(),
        "job done"
    );
    metrics.record(workflow.as_ref(), status);
}
