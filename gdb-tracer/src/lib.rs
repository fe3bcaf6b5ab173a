//! GDB Tracer - Dynamic execution tracing through a remote debug stub
//!
//! This crate drives an instrumented target running under a gdbstub and
//! records the heap events it reports, producing one binary trace file per
//! test case for side-channel analysis.
//!
//! # Overview
//!
//! The target and the tracer talk through a small communication buffer in
//! target memory, guarded by a write watchpoint:
//!
//! * The target requests a test case; the tracer copies it into target memory
//! * The target announces the start of the test case; the tracer single-steps
//! * Allocation, free, stack and stepover events arrive as packets and are
//!   dispatched as they are observed
//! * The target announces the end of the test case; the trace is finalized
//!
//! # Usage
//!
//! ```no_run
//! use gdb_tracer::{GdbTracer, RspSession, TraceEntity};
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), gdb_tracer::TracerError> {
//! let session = RspSession::connect("localhost", 1234).await?;
//! let mut tracer = GdbTracer::attach(session, 0xffffffff80111020, CancellationToken::new()).await?;
//!
//! let entity = TraceEntity { id: 0, testcase_file_path: "0.testcase".into() };
//! let summary = tracer.generate_trace(&entity, Path::new("traces")).await?;
//! println!("{} allocations traced", summary.allocations);
//!
//! tracer.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod comm;
pub mod error;
pub mod ledger;
pub mod packets;
pub mod rsp;
pub mod session;
pub mod trace;
pub mod tracer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use comm::CommunicationBuffer;
pub use error::TracerError;
pub use ledger::{AllocationLedger, AllocationRecord};
pub use packets::{Packet, PacketType};
pub use rsp::RspSession;
pub use session::{DebugSession, ResumeAction, SessionError, StopReply, WatchpointKind};
pub use trace::{read_trace, TraceRecord, TraceWriter};
pub use tracer::{GdbTracer, StackBounds, TraceEntity, TraceSummary};

/// Result type for tracer operations
pub type Result<T> = std::result::Result<T, TracerError>;
