//! Trace generation state machine
//!
//! Drives one test case through the target:
//!
//! 1. continue until the target requests a test case, then deliver it
//! 2. continue until the target announces the test case start
//! 3. single-step (or continue while in stepover mode), dispatching every
//!    communication packet, until the target announces the test case end
//!
//! Protocol events are written to the trace in the order their stops were
//! observed. Each resume completes before the next one is issued.

use crate::comm::CommunicationBuffer;
use crate::error::TracerError;
use crate::ledger::AllocationLedger;
use crate::packets::{Packet, PacketType};
use crate::session::{DebugSession, ResumeAction, StopReply};
use crate::trace::{trace_file_path, TraceRecord, TraceWriter};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// One test case to be traced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntity {
    pub id: u64,
    pub testcase_file_path: PathBuf,
}

/// Stack bounds reported by the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackBounds {
    pub low: u64,
    pub high: u64,
}

/// Result of a successful trace generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub testcase_id: u64,
    pub trace_file: PathBuf,
    /// Allocation records written
    pub allocations: usize,
    /// Free records written
    pub frees: usize,
    /// Frees skipped because no live allocation matched
    pub unmatched_frees: usize,
    /// Ordinary stops while stepping
    pub steps: u64,
    pub stack: Option<StackBounds>,
    /// Allocations still live at the end of the test case
    pub live_allocations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraceState {
    AwaitingTestcaseRequest,
    AwaitingTestcaseStart,
    Stepping,
    Done,
}

/// Outcome of dispatching one packet while stepping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Append this record to the trace
    Record(TraceRecord),
    /// Internal state changed, nothing to write
    Nothing,
    /// The traced region ended
    End,
}

/// Mutable state of the stepping phase
#[derive(Debug, Default)]
pub struct StepState {
    pub ledger: AllocationLedger,
    pub stack: Option<StackBounds>,
    /// While set, the target is continued instead of single-stepped
    pub stepover: bool,
    pub steps: u64,
    pub allocations: usize,
    pub frees: usize,
    pub unmatched_frees: usize,
}

impl StepState {
    /// Fresh state for a new test case
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume action for the next iteration
    pub fn next_action(&self) -> ResumeAction {
        if self.stepover {
            ResumeAction::Continue
        } else {
            ResumeAction::Step
        }
    }

    /// Apply a packet received during stepping
    pub fn dispatch(&mut self, packet: Packet) -> Result<Dispatch, TracerError> {
        match packet {
            Packet::Allocation(p) => {
                let record = self.ledger.allocate(p.address, p.length)?;
                self.allocations += 1;
                Ok(Dispatch::Record(TraceRecord::Allocation(record)))
            }
            Packet::Free(p) => match self.ledger.free(p.address) {
                Some(record) => {
                    self.frees += 1;
                    Ok(Dispatch::Record(TraceRecord::Free { id: record.id }))
                }
                None => {
                    tracing::warn!(
                        "Free of address {:016X} does not correspond to any allocation, skipping",
                        p.address
                    );
                    self.unmatched_frees += 1;
                    Ok(Dispatch::Nothing)
                }
            },
            Packet::TestcaseEnd => Ok(Dispatch::End),
            Packet::StackInfo(p) => {
                self.stack = Some(StackBounds {
                    low: p.top_address,
                    high: p.base_address,
                });
                Ok(Dispatch::Nothing)
            }
            Packet::StepoverBegin => {
                self.stepover = true;
                Ok(Dispatch::Nothing)
            }
            Packet::StepoverEnd => {
                self.stepover = false;
                Ok(Dispatch::Nothing)
            }
            Packet::TestcaseRequest(_) | Packet::TestcaseStart => {
                Err(TracerError::OutOfPhase(packet.packet_type()))
            }
        }
    }

    /// Hook for ordinary (non-communication) stops
    pub fn on_instruction(&mut self, _stop: &StopReply) {
        self.steps += 1;
    }

    fn into_summary(self, testcase_id: u64, trace_file: PathBuf) -> TraceSummary {
        TraceSummary {
            testcase_id,
            trace_file,
            allocations: self.allocations,
            frees: self.frees,
            unmatched_frees: self.unmatched_frees,
            steps: self.steps,
            stack: self.stack,
            live_allocations: self.ledger.len(),
        }
    }
}

/// Tracer owning an exclusive debug session
///
/// Not safe for concurrent use: one trace generation at a time. A failed
/// trace generation leaves the target mid-handshake, so every later call
/// fails with [`TracerError::Desynchronized`].
pub struct GdbTracer<S: DebugSession> {
    session: S,
    buffer: CommunicationBuffer,
    cancel: CancellationToken,
    desynced: bool,
}

impl<S: DebugSession> GdbTracer<S> {
    /// Initialize the session and arm the communication buffer
    ///
    /// The session is disposed if setup fails.
    pub async fn attach(
        mut session: S,
        buffer_address: u64,
        cancel: CancellationToken,
    ) -> Result<Self, TracerError> {
        let mut buffer = CommunicationBuffer::new(buffer_address);
        if let Err(e) = Self::setup(&mut session, &mut buffer, &cancel).await {
            session.dispose(&cancel).await;
            return Err(e);
        }
        Ok(Self {
            session,
            buffer,
            cancel,
            desynced: false,
        })
    }

    async fn setup(
        session: &mut S,
        buffer: &mut CommunicationBuffer,
        cancel: &CancellationToken,
    ) -> Result<(), TracerError> {
        tracing::debug!("Initializing debug session");
        session.init(cancel).await?;
        buffer.arm(session, cancel).await
    }

    /// Dispose the debug session
    pub async fn shutdown(mut self) {
        self.session.dispose(&self.cancel).await;
    }

    /// Generate the trace of one test case into `output_directory`
    ///
    /// On error the trace file is removed and the tracer refuses further
    /// test cases.
    pub async fn generate_trace(
        &mut self,
        entity: &TraceEntity,
        output_directory: &Path,
    ) -> Result<TraceSummary, TracerError> {
        if self.desynced {
            return Err(TracerError::Desynchronized);
        }
        let writer = TraceWriter::create(trace_file_path(output_directory, entity.id))?;

        let result = self.run(entity, writer).await;
        if let Err(e) = &result {
            tracing::warn!("Testcase #{} failed, debug session out of sync: {}", entity.id, e);
            self.desynced = true;
        }
        result
    }

    async fn run(
        &mut self,
        entity: &TraceEntity,
        mut writer: TraceWriter,
    ) -> Result<TraceSummary, TracerError> {
        let mut state = TraceState::AwaitingTestcaseRequest;
        let mut stepping = StepState::new();
        while state != TraceState::Done {
            self.check_cancelled()?;
            state = match state {
                TraceState::AwaitingTestcaseRequest => {
                    self.deliver_testcase(entity).await?;
                    TraceState::AwaitingTestcaseStart
                }
                TraceState::AwaitingTestcaseStart => {
                    let stop = self.resume(ResumeAction::Continue).await?;
                    self.expect_packet(stop, PacketType::TestcaseStart).await?;
                    tracing::debug!("Testcase #{} started", entity.id);
                    TraceState::Stepping
                }
                TraceState::Stepping => {
                    if self.step(&mut stepping, &mut writer).await? {
                        TraceState::Done
                    } else {
                        TraceState::Stepping
                    }
                }
                TraceState::Done => TraceState::Done,
            };
        }

        let trace_file = writer.finish()?;
        let summary = stepping.into_summary(entity.id, trace_file);
        tracing::info!(
            "Trace #{} complete: {} allocations, {} frees, {} steps",
            entity.id,
            summary.allocations,
            summary.frees,
            summary.steps
        );
        Ok(summary)
    }

    /// Wait for the test case request and answer it
    async fn deliver_testcase(&mut self, entity: &TraceEntity) -> Result<(), TracerError> {
        // Load the test case while the target runs towards its request
        let (stop, testcase) = tokio::join!(
            self.session.resume(&[ResumeAction::Continue], &self.cancel),
            tokio::fs::read(&entity.testcase_file_path),
        );
        let stop = stop?;
        let testcase = testcase?;

        let packet = self.expect_packet(stop, PacketType::TestcaseRequest).await?;
        let Packet::TestcaseRequest(request) = packet else {
            return Err(TracerError::UnexpectedPacket {
                found: packet.packet_type(),
                expected: PacketType::TestcaseRequest,
            });
        };

        tracing::debug!(
            "Writing {} byte testcase to {:#x} ({} bytes available)",
            testcase.len(),
            request.address,
            request.buffer_size
        );
        self.buffer
            .answer_testcase_request(&mut self.session, request, &testcase, &self.cancel)
            .await?;
        Ok(())
    }

    /// Require a communication stop carrying a packet of the given type
    async fn expect_packet(
        &mut self,
        stop: StopReply,
        expected: PacketType,
    ) -> Result<Packet, TracerError> {
        if !self.buffer.is_communication_stop(&stop) {
            return Err(TracerError::UnexpectedStop(stop));
        }
        let packet = self.buffer.retrieve(&mut self.session, &self.cancel).await?;
        if packet.packet_type() != expected {
            return Err(TracerError::UnexpectedPacket {
                found: packet.packet_type(),
                expected,
            });
        }
        Ok(packet)
    }

    /// Run one stepping iteration; returns whether the test case ended
    async fn step(
        &mut self,
        stepping: &mut StepState,
        writer: &mut TraceWriter,
    ) -> Result<bool, TracerError> {
        let stop = self.resume(stepping.next_action()).await?;

        if self.buffer.is_communication_stop(&stop) {
            let packet = self.buffer.retrieve(&mut self.session, &self.cancel).await?;
            match stepping.dispatch(packet)? {
                Dispatch::Record(record) => writer.append(&record)?,
                Dispatch::Nothing => {}
                Dispatch::End => return Ok(true),
            }
        } else if matches!(stop, StopReply::Signal { .. }) {
            stepping.on_instruction(&stop);
        } else {
            return Err(TracerError::UnexpectedStop(stop));
        }
        Ok(false)
    }

    async fn resume(&mut self, action: ResumeAction) -> Result<StopReply, TracerError> {
        Ok(self.session.resume(&[action], &self.cancel).await?)
    }

    fn check_cancelled(&self) -> Result<(), TracerError> {
        if self.cancel.is_cancelled() {
            Err(TracerError::Cancelled)
        } else {
            Ok(())
        }
    }
}
