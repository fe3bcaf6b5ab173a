//! Communication buffer protocol
//!
//! The target and the tracer share a small buffer in target memory. The
//! target writes a packet and sets the trigger byte, which fires a write
//! watchpoint on the buffer base; the tracer then downloads and decodes the
//! packet. Only test case requests are answered.

use crate::error::TracerError;
use crate::packets::{
    encode_testcase_request, Packet, TestcaseRequestPacket, TriggerCode, BUFFER_LEN,
    TRIGGER_OFFSET,
};
use crate::session::{DebugSession, StopReply, WatchpointKind};
use tokio_util::sync::CancellationToken;

/// Local mirror of the communication buffer in target memory
#[derive(Debug, Clone)]
pub struct CommunicationBuffer {
    address: u64,
    local: [u8; BUFFER_LEN],
}

impl CommunicationBuffer {
    /// Create a buffer mirror for the target address
    pub fn new(address: u64) -> Self {
        Self {
            address,
            local: [0; BUFFER_LEN],
        }
    }

    /// Install the trigger watchpoint and hand the buffer to the target
    pub async fn arm<S: DebugSession + ?Sized>(
        &mut self,
        session: &mut S,
        cancel: &CancellationToken,
    ) -> Result<(), TracerError> {
        tracing::debug!("Installing communication watchpoint at {:#x}", self.address);
        session
            .insert_watchpoint(WatchpointKind::Write, self.address, 1, cancel)
            .await?;
        session
            .write_memory(self.address, &[TriggerCode::DebuggerWrite as u8], cancel)
            .await?;
        Ok(())
    }

    /// Whether the stop was caused by the target writing the buffer
    pub fn is_communication_stop(&self, stop: &StopReply) -> bool {
        stop.hit_watchpoint(self.address)
    }

    /// Download the buffer and decode the packet it holds
    ///
    /// Only valid right after a communication stop.
    pub async fn retrieve<S: DebugSession + ?Sized>(
        &mut self,
        session: &mut S,
        cancel: &CancellationToken,
    ) -> Result<Packet, TracerError> {
        session.read_memory(self.address, &mut self.local, cancel).await?;
        let packet = Packet::decode(&self.local)?;
        tracing::debug!("Received packet {:?}", packet);
        Ok(packet)
    }

    /// Deliver a test case in answer to a request
    ///
    /// The data goes straight to the address named in the request; the
    /// buffer then receives the updated request and, last, the trigger byte.
    /// Fails before touching target memory if the data does not fit.
    pub async fn answer_testcase_request<S: DebugSession + ?Sized>(
        &mut self,
        session: &mut S,
        request: TestcaseRequestPacket,
        testcase: &[u8],
        cancel: &CancellationToken,
    ) -> Result<TestcaseRequestPacket, TracerError> {
        if request.buffer_size < 0 || testcase.len() as u64 > request.buffer_size as u64 {
            return Err(TracerError::InsufficientBuffer {
                offered: request.buffer_size,
                needed: testcase.len(),
            });
        }

        session.write_memory(request.address, testcase, cancel).await?;

        let answer = request.with_testcase_size(testcase.len() as i64);
        self.local = encode_testcase_request(&self.local, &answer)?;
        session
            .write_memory(self.address + 1, &self.local[TRIGGER_OFFSET + 1..], cancel)
            .await?;
        session
            .write_memory(self.address, &self.local[..=TRIGGER_OFFSET], cancel)
            .await?;
        Ok(answer)
    }
}
