//! Trace generation through a GDB remote target
//!
//! Not parallelizable: the stage owns a single debugger connection, and the
//! traced target keeps state between test cases.

use crate::config::{parse_options, GdbTraceConfig};
use crate::stage::TraceStage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use gdb_tracer::{DebugSession, GdbTracer, RspSession, TraceEntity, TraceSummary};
use std::path::PathBuf;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Opens the debug session used by [`GdbTraceGenerator`]
#[async_trait]
pub trait Connect: Send + Sync {
    type Session: DebugSession + 'static;

    async fn connect(&self, config: &GdbTraceConfig) -> Result<Self::Session>;
}

/// Connects to a gdbstub over TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connect for TcpConnector {
    type Session = RspSession<TcpStream>;

    async fn connect(&self, config: &GdbTraceConfig) -> Result<Self::Session> {
        RspSession::connect(&config.host, config.port)
            .await
            .with_context(|| format!("Failed to connect to {}:{}", config.host, config.port))
    }
}

/// Trace stage driving an instrumented target through a debug session
pub struct GdbTraceGenerator<C: Connect> {
    connector: C,
    cancel: CancellationToken,
    output_directory: PathBuf,
    tracer: Option<GdbTracer<C::Session>>,
}

impl<C: Connect> GdbTraceGenerator<C> {
    /// Create an uninitialized stage; `cancel` aborts all of its work
    pub fn new(connector: C, cancel: CancellationToken) -> Self {
        Self {
            connector,
            cancel,
            output_directory: PathBuf::new(),
            tracer: None,
        }
    }

    /// Configure directly from a typed configuration
    pub async fn init_with(&mut self, config: GdbTraceConfig) -> Result<()> {
        tokio::fs::create_dir_all(&config.output_directory)
            .await
            .with_context(|| format!("Failed to create {:?}", config.output_directory))?;

        tracing::debug!("Connecting to remote target");
        let session = self.connector.connect(&config).await?;

        tracing::debug!("Installing communication watchpoint");
        let tracer = GdbTracer::attach(session, config.buffer_address, self.cancel.clone())
            .await
            .context("Failed to set up debug session")?;

        self.output_directory = config.output_directory;
        self.tracer = Some(tracer);
        Ok(())
    }
}

#[async_trait]
impl<C: Connect> TraceStage for GdbTraceGenerator<C> {
    async fn init(&mut self, options: &serde_yaml::Value) -> Result<()> {
        let config = parse_options(options).context("Invalid gdb trace options")?;
        self.init_with(config).await
    }

    fn supports_parallelism(&self) -> bool {
        false
    }

    async fn generate_trace(&mut self, entity: &TraceEntity) -> Result<TraceSummary> {
        let tracer = self
            .tracer
            .as_mut()
            .context("Trace stage used before init")?;

        let summary = tracer
            .generate_trace(entity, &self.output_directory)
            .await
            .with_context(|| format!("Trace generation failed for testcase #{}", entity.id))?;

        let summary_path = self.output_directory.join(format!("t{}.json", entity.id));
        if let Err(e) = write_summary(&summary_path, &summary).await {
            // A trace without its summary counts as failed
            if let Err(remove) = tokio::fs::remove_file(&summary.trace_file).await {
                tracing::warn!("Failed to remove trace {:?}: {}", summary.trace_file, remove);
            }
            return Err(e);
        }

        Ok(summary)
    }

    async fn uninit(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(tracer) = self.tracer.take() {
            tracer.shutdown().await;
        }
        Ok(())
    }
}

async fn write_summary(path: &std::path::Path, summary: &TraceSummary) -> Result<()> {
    let json = serde_json::to_vec_pretty(summary)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {:?}", path))
}
