//! Live allocation bookkeeping

use crate::error::TracerError;
use binrw::binrw;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A heap allocation observed in the target
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    /// Identifier, assigned in order of first sight starting at 0
    pub id: u32,
    pub address: u64,
    pub size: u32,
}

/// Table of live allocations keyed by address
///
/// Scoped to a single test case; identifiers restart at 0 for each ledger.
#[derive(Debug, Default)]
pub struct AllocationLedger {
    live: BTreeMap<u64, AllocationRecord>,
    next_id: u32,
    exhausted: bool,
}

impl AllocationLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new allocation and assign it the next identifier
    ///
    /// An allocation at an address that is still live replaces the old entry.
    /// Fails once every `u32` identifier has been handed out.
    pub fn allocate(&mut self, address: u64, size: u32) -> Result<AllocationRecord, TracerError> {
        if self.exhausted {
            return Err(TracerError::AllocationIdsExhausted);
        }
        let record = AllocationRecord {
            id: self.next_id,
            address,
            size,
        };
        match self.next_id.checked_add(1) {
            Some(next) => self.next_id = next,
            None => self.exhausted = true,
        }

        if let Some(previous) = self.live.insert(address, record) {
            tracing::debug!(
                "Allocation #{} at {:#018x} replaces live allocation #{}",
                record.id,
                address,
                previous.id
            );
        }
        Ok(record)
    }

    /// Remove and return the live allocation at `address`, if any
    pub fn free(&mut self, address: u64) -> Option<AllocationRecord> {
        self.live.remove(&address)
    }

    /// Number of live allocations
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no allocation is live
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
