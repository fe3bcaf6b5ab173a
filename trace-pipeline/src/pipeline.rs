//! Sequential pipeline runner
//!
//! Feeds test cases one by one into the trace stage. Both stages are always
//! un-initialized, whether the run completes, fails or is cancelled.

use crate::config::PipelineConfig;
use crate::stage::{TestcaseStage, TraceStage};
use anyhow::{Context, Result};
use gdb_tracer::{TraceSummary, TracerError};
use tokio_util::sync::CancellationToken;

/// Outcome of a pipeline run
#[derive(Debug, Default)]
pub struct PipelineReport {
    /// Successfully traced test cases, in order
    pub traced: Vec<TraceSummary>,
    /// Test cases whose trace generation failed, with the error message
    pub failed: Vec<(u64, String)>,
}

/// Run the pipeline to completion
pub async fn run_pipeline<T, G>(
    testcases: &mut T,
    traces: &mut G,
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> Result<PipelineReport>
where
    T: TestcaseStage + ?Sized,
    G: TraceStage + ?Sized,
{
    let result = drive(testcases, traces, config, cancel).await;

    let traces_down = traces.uninit().await.context("Failed to uninit trace stage");
    let testcases_down = testcases
        .uninit()
        .await
        .context("Failed to uninit testcase stage");

    let report = result?;
    traces_down?;
    testcases_down?;
    Ok(report)
}

async fn drive<T, G>(
    testcases: &mut T,
    traces: &mut G,
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> Result<PipelineReport>
where
    T: TestcaseStage + ?Sized,
    G: TraceStage + ?Sized,
{
    testcases
        .init(&config.testcase)
        .await
        .context("Failed to initialize testcase stage")?;
    traces
        .init(&config.trace)
        .await
        .context("Failed to initialize trace stage")?;

    let mut report = PipelineReport::default();
    while !testcases.is_done() {
        if cancel.is_cancelled() {
            return Err(TracerError::Cancelled.into());
        }

        let entity = testcases.next_testcase(cancel).await?;
        match traces.generate_trace(&entity).await {
            Ok(summary) => report.traced.push(summary),
            Err(e) if config.skip_failed && is_skippable(&e) => {
                tracing::error!("{:#}; skipping testcase", e);
                report.failed.push((entity.id, format!("{:#}", e)));
            }
            Err(e) => return Err(e),
        }
    }

    tracing::info!(
        "Pipeline finished: {} traces, {} failures",
        report.traced.len(),
        report.failed.len()
    );
    Ok(report)
}

/// Whether an error is the result of cancellation
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<TracerError>(), Some(TracerError::Cancelled))
}

/// Whether the pipeline may continue with the next test case after `err`
///
/// Cancellation and errors that leave the debug session out of sync are
/// never skipped.
fn is_skippable(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<TracerError>() {
        Some(e) => !matches!(e, TracerError::Cancelled) && !e.is_desync(),
        None => true,
    }
}
