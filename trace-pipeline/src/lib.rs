//! Trace Pipeline - Test case generation and trace generation stages
//!
//! This crate connects test case generation and GDB-based trace generation
//! into a sequential pipeline driven by a YAML configuration.

pub mod config;
pub mod gdb;
pub mod pipeline;
pub mod random;
pub mod stage;

pub use config::{GdbTraceConfig, PipelineConfig, RandomTestcaseConfig};
pub use gdb::{Connect, GdbTraceGenerator, TcpConnector};
pub use pipeline::{is_cancellation, run_pipeline, PipelineReport};
pub use random::RandomTestcaseGenerator;
pub use stage::{TestcaseStage, TraceStage};

/// Result type for pipeline operations
pub type Result<T> = anyhow::Result<T>;
