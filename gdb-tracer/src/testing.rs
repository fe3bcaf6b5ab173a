//! Scripted in-memory target for tests
//!
//! Plays back a fixed sequence of target events through the
//! [`DebugSession`] interface and records every operation it receives.

use crate::packets::{encode_packet, Packet};
use crate::session::{DebugSession, ResumeAction, SessionError, StopReply, WatchpointKind};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// What the target does when resumed
#[derive(Debug, Clone)]
pub enum TargetEvent {
    /// Write a packet to the communication buffer, firing the watchpoint
    Packet(Packet),
    /// Execute one instruction without touching the buffer
    Step,
    /// Stop for an arbitrary reason
    Stop(StopReply),
    /// Run until the session is cancelled
    Hang,
}

/// Operation issued against the scripted target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOp {
    Init,
    InsertWatchpoint {
        kind: WatchpointKind,
        address: u64,
        length: u32,
    },
    WriteMemory { address: u64, data: Vec<u8> },
    ReadMemory { address: u64, length: usize },
    Resume(Vec<ResumeAction>),
    Dispose,
}

#[derive(Debug, Default)]
struct Inner {
    buffer_address: u64,
    memory: BTreeMap<u64, u8>,
    script: VecDeque<TargetEvent>,
    ops: Vec<SessionOp>,
}

/// Fake debug session backed by a script of target events
///
/// Clones share state, so a test can keep a handle for inspection after
/// handing the session to the tracer.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTarget {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedTarget {
    /// Create a target whose communication buffer lives at `buffer_address`
    pub fn new(buffer_address: u64) -> Self {
        let target = Self::default();
        target.lock().buffer_address = buffer_address;
        target
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not hide the original failure.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue events for subsequent resumes
    pub fn script(&self, events: impl IntoIterator<Item = TargetEvent>) {
        self.lock().script.extend(events);
    }

    /// Queue a packet event
    pub fn push_packet(&self, packet: Packet) {
        self.lock().script.push_back(TargetEvent::Packet(packet));
    }

    /// Read target memory; unwritten bytes are zero
    pub fn memory(&self, address: u64, length: usize) -> Vec<u8> {
        let inner = self.lock();
        (0..length as u64)
            .map(|i| inner.memory.get(&(address + i)).copied().unwrap_or(0))
            .collect()
    }

    /// Every operation received so far
    pub fn ops(&self) -> Vec<SessionOp> {
        self.lock().ops.clone()
    }

    /// Actions of every resume received so far
    pub fn resumes(&self) -> Vec<ResumeAction> {
        self.lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                SessionOp::Resume(actions) => actions.first().copied(),
                _ => None,
            })
            .collect()
    }

    /// Memory writes received so far
    pub fn writes(&self) -> Vec<(u64, Vec<u8>)> {
        self.lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                SessionOp::WriteMemory { address, data } => Some((*address, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// How often the session was disposed
    pub fn dispose_count(&self) -> usize {
        self.lock()
            .ops
            .iter()
            .filter(|op| matches!(op, SessionOp::Dispose))
            .count()
    }

    /// Events not consumed yet
    pub fn remaining(&self) -> usize {
        self.lock().script.len()
    }
}

fn check(cancel: &CancellationToken) -> Result<(), SessionError> {
    if cancel.is_cancelled() {
        Err(SessionError::Cancelled)
    } else {
        Ok(())
    }
}

#[async_trait]
impl DebugSession for ScriptedTarget {
    async fn init(&mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        check(cancel)?;
        self.lock().ops.push(SessionOp::Init);
        Ok(())
    }

    async fn insert_watchpoint(
        &mut self,
        kind: WatchpointKind,
        address: u64,
        length: u32,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        check(cancel)?;
        self.lock().ops.push(SessionOp::InsertWatchpoint {
            kind,
            address,
            length,
        });
        Ok(())
    }

    async fn write_memory(
        &mut self,
        address: u64,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        check(cancel)?;
        let mut inner = self.lock();
        for (i, byte) in data.iter().enumerate() {
            inner.memory.insert(address + i as u64, *byte);
        }
        inner.ops.push(SessionOp::WriteMemory {
            address,
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn read_memory(
        &mut self,
        address: u64,
        out: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        check(cancel)?;
        let mut inner = self.lock();
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = inner.memory.get(&(address + i as u64)).copied().unwrap_or(0);
        }
        inner.ops.push(SessionOp::ReadMemory {
            address,
            length: out.len(),
        });
        Ok(())
    }

    async fn resume(
        &mut self,
        actions: &[ResumeAction],
        cancel: &CancellationToken,
    ) -> Result<StopReply, SessionError> {
        check(cancel)?;
        let event = {
            let mut inner = self.lock();
            inner.ops.push(SessionOp::Resume(actions.to_vec()));
            inner.script.pop_front()
        };

        match event {
            Some(TargetEvent::Packet(packet)) => {
                let encoded =
                    encode_packet(&packet).map_err(|e| SessionError::Protocol(e.to_string()))?;
                let mut inner = self.lock();
                let base = inner.buffer_address;
                for (i, byte) in encoded.iter().enumerate() {
                    inner.memory.insert(base + i as u64, *byte);
                }
                Ok(StopReply::Signal {
                    signal: 5,
                    watchpoints: vec![base],
                })
            }
            Some(TargetEvent::Step) => Ok(StopReply::Signal {
                signal: 5,
                watchpoints: vec![],
            }),
            Some(TargetEvent::Stop(stop)) => Ok(stop),
            Some(TargetEvent::Hang) => {
                cancel.cancelled().await;
                Err(SessionError::Cancelled)
            }
            None => Ok(StopReply::Exited { status: 0 }),
        }
    }

    async fn dispose(&mut self, _cancel: &CancellationToken) {
        self.lock().ops.push(SessionOp::Dispose);
    }
}
