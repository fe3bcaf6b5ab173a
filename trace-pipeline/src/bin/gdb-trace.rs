//! Runs the random test case generator and the GDB trace generator

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use trace_pipeline::{
    is_cancellation, run_pipeline, GdbTraceGenerator, PipelineConfig, RandomTestcaseGenerator,
    TcpConnector,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Generate heap event traces of an instrumented target via a gdbstub")]
struct Args {
    /// Pipeline configuration file (YAML)
    #[arg(short, long, env = "GDB_TRACE_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = PipelineConfig::from_yaml_file(&args.config)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, shutting down");
                cancel.cancel();
            }
        }
    });

    let mut testcases = RandomTestcaseGenerator::new();
    let mut traces = GdbTraceGenerator::new(TcpConnector, cancel.child_token());

    match run_pipeline(&mut testcases, &mut traces, &config, &cancel).await {
        Ok(report) => {
            for (id, error) in &report.failed {
                tracing::warn!("Testcase #{} failed: {}", id, error);
            }
            Ok(())
        }
        Err(e) if is_cancellation(&e) => {
            tracing::info!("Cancelled");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
