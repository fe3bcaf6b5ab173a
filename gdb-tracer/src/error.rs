//! Error types for trace generation

use crate::packets::PacketType;
use crate::session::{SessionError, StopReply};
use thiserror::Error;

/// Failure of a trace generation invocation
///
/// Every variant except [`TracerError::Cancelled`] is fatal for the current
/// test case; see [`TracerError::is_desync`] for those that are fatal for the
/// whole session. Unmatched frees are not errors and never surface here.
#[derive(Debug, Error)]
pub enum TracerError {
    #[error("Unexpected stop: {0:?}")]
    UnexpectedStop(StopReply),

    #[error("Unexpected packet type \"{found:?}\", expected \"{expected:?}\"")]
    UnexpectedPacket {
        found: PacketType,
        expected: PacketType,
    },

    #[error("Packet type \"{0:?}\" is not valid while stepping")]
    OutOfPhase(PacketType),

    #[error("Unknown packet type tag {0}")]
    UnknownPacketType(u32),

    #[error("Malformed communication buffer: {0}")]
    Malformed(#[from] binrw::Error),

    #[error("Insufficient testcase buffer space: Target offered {offered} bytes, {needed} bytes needed")]
    InsufficientBuffer { offered: i64, needed: usize },

    #[error("Allocation identifiers exhausted")]
    AllocationIdsExhausted,

    #[error("Debug session is out of sync after an earlier failure")]
    Desynchronized,

    #[error("Debug session failed: {0}")]
    Session(SessionError),

    #[error("Trace I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Trace generation cancelled")]
    Cancelled,
}

impl TracerError {
    /// Whether the debug session is unusable after this error
    ///
    /// True when the target and tracer disagree on the protocol state or the
    /// transport itself failed. Later test cases on the same session cannot
    /// succeed.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            TracerError::UnexpectedStop(_)
                | TracerError::UnexpectedPacket { .. }
                | TracerError::OutOfPhase(_)
                | TracerError::UnknownPacketType(_)
                | TracerError::Malformed(_)
                | TracerError::InsufficientBuffer { .. }
                | TracerError::AllocationIdsExhausted
                | TracerError::Desynchronized
                | TracerError::Session(_)
        )
    }
}

impl From<SessionError> for TracerError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Cancelled => TracerError::Cancelled,
            other => TracerError::Session(other),
        }
    }
}
