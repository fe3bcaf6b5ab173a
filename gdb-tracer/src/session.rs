//! Debug session interface
//!
//! The small capability surface the tracer needs from a remote debugger.
//! [`crate::rsp::RspSession`] implements it over the GDB remote serial
//! protocol; tests substitute a scripted target.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Transport-level failure
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed reply: {0}")]
    Protocol(String),

    #[error("Remote returned error {0:#04x}")]
    ErrorReply(u8),

    #[error("Remote does not support {0}")]
    Unsupported(String),

    #[error("Connection closed by remote")]
    Closed,

    #[error("Operation cancelled")]
    Cancelled,
}

/// Kind of memory access that triggers a watchpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchpointKind {
    Write,
    Read,
    Access,
}

/// Resume action for the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    Step,
    Continue,
}

/// Reason the target halted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReply {
    /// Target stopped with a signal; lists the addresses of any watchpoints hit
    Signal { signal: u8, watchpoints: Vec<u64> },
    /// Target process exited
    Exited { status: u8 },
    /// Target process was terminated by a signal
    Terminated { signal: u8 },
}

impl StopReply {
    /// Whether this stop was caused by the watchpoint at `address`
    pub fn hit_watchpoint(&self, address: u64) -> bool {
        matches!(self, StopReply::Signal { watchpoints, .. } if watchpoints.contains(&address))
    }
}

/// Remote debugger connection driving one target
///
/// Every operation receives the session-wide cancellation token and must
/// return [`SessionError::Cancelled`] promptly once it fires.
#[async_trait]
pub trait DebugSession: Send {
    /// Establish the session
    async fn init(&mut self, cancel: &CancellationToken) -> Result<(), SessionError>;

    /// Install a hardware watchpoint covering `length` bytes at `address`
    async fn insert_watchpoint(
        &mut self,
        kind: WatchpointKind,
        address: u64,
        length: u32,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError>;

    /// Write `data` to target memory
    async fn write_memory(
        &mut self,
        address: u64,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), SessionError>;

    /// Fill `out` with target memory starting at `address`
    async fn read_memory(
        &mut self,
        address: u64,
        out: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<(), SessionError>;

    /// Resume the target and wait until it stops again
    async fn resume(
        &mut self,
        actions: &[ResumeAction],
        cancel: &CancellationToken,
    ) -> Result<StopReply, SessionError>;

    /// Release all session resources
    ///
    /// Best effort: runs even if `cancel` has already fired.
    async fn dispose(&mut self, cancel: &CancellationToken);
}
