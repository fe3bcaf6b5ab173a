//! Pipeline stage interfaces

use anyhow::Result;
use async_trait::async_trait;
use gdb_tracer::{TraceEntity, TraceSummary};
use tokio_util::sync::CancellationToken;

/// Produces the test cases to be traced
#[async_trait]
pub trait TestcaseStage: Send {
    /// Configure the stage from its options block
    async fn init(&mut self, options: &serde_yaml::Value) -> Result<()>;

    /// Generate the next test case
    async fn next_testcase(&mut self, cancel: &CancellationToken) -> Result<TraceEntity>;

    /// Whether no further test cases will be produced
    ///
    /// Called before every [`TestcaseStage::next_testcase`].
    fn is_done(&self) -> bool;

    async fn uninit(&mut self) -> Result<()>;
}

/// Turns test cases into trace files
#[async_trait]
pub trait TraceStage: Send {
    /// Configure the stage from its options block
    async fn init(&mut self, options: &serde_yaml::Value) -> Result<()>;

    /// Whether several traces may be generated concurrently
    fn supports_parallelism(&self) -> bool;

    /// Generate the trace for one test case
    async fn generate_trace(&mut self, entity: &TraceEntity) -> Result<TraceSummary>;

    /// Cancel outstanding work and release resources
    async fn uninit(&mut self) -> Result<()>;
}
