//! Scratch memory inside the target process.
//!
//! Every parameter cell, trigger stub and callback stub lives in memory
//! this arena allocated and recorded. Teardown walks the record table, so
//! nothing is ever left behind in a still-running target, and nothing is
//! retried against a target that already exited.

use std::collections::HashMap;

use strum::Display;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::process::{ProcessMemory, Protection};

/// Default block size; matches the scratch blocks the controller carves
/// parameter cells out of.
pub const DEFAULT_BLOCK_SIZE: usize = 2048;

/// What a tracked block is for. Purely diagnostic, but it makes teardown
/// logs readable when a target dies halfway through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SlotPurpose {
    #[strum(serialize = "parameter slot")]
    ParameterSlot,
    #[strum(serialize = "data slot")]
    DataSlot,
    #[strum(serialize = "callback slot")]
    CallbackSlot,
    #[strum(serialize = "trigger slot")]
    TriggerSlot,
}

/// One recorded allocation.
#[derive(Debug, Clone)]
pub struct TrackedBlock {
    pub addr: u64,
    pub size: usize,
    pub purpose: SlotPurpose,
    pub name: String,
}

/// Allocation table for controller-owned memory in the target.
#[derive(Debug, Default)]
pub struct MemoryArena {
    blocks: Vec<TrackedBlock>,
}

impl MemoryArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate and record a scratch block. Stubs execute out of these, so
    /// everything is RWX like the rest of the controller's scratch memory.
    pub fn allocate<P: ProcessMemory>(
        &mut self,
        process: &P,
        size: usize,
        purpose: SlotPurpose,
        name: &str,
    ) -> Result<u64> {
        let addr = process.allocate(size, None, Protection::ExecuteReadWrite)?;
        debug!("Allocated {} '{}' at {:#x} ({} bytes)", purpose, name, addr, size);
        self.blocks.push(TrackedBlock {
            addr,
            size,
            purpose,
            name: name.to_string(),
        });
        Ok(addr)
    }

    /// Allocate one block and carve an 8-byte pointer cell per name out of
    /// it, in order. The block is tracked as a single entry; the cells are
    /// plain addresses inside it.
    pub fn reserve_pointers<P: ProcessMemory>(
        &mut self,
        process: &P,
        names: &[&str],
    ) -> Result<HashMap<String, u64>> {
        if names.len() * 8 > DEFAULT_BLOCK_SIZE {
            return Err(Error::AllocationFailed {
                size: names.len() * 8,
                message: format!("too many pointer cells for one {DEFAULT_BLOCK_SIZE}-byte block"),
            });
        }

        let base = self.allocate(
            process,
            DEFAULT_BLOCK_SIZE,
            SlotPurpose::ParameterSlot,
            "pointer block",
        )?;

        let mut cells = HashMap::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            cells.insert(name.to_string(), base + (index as u64 * 8));
        }
        Ok(cells)
    }

    /// Free one tracked block.
    pub fn free<P: ProcessMemory>(&mut self, process: &P, addr: u64) -> Result<()> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.addr == addr)
            .ok_or(Error::FreeFailed {
                address: addr,
                message: "address not tracked by arena".to_string(),
            })?;

        process.free(addr)?;
        self.blocks.remove(index);
        Ok(())
    }

    /// Free every tracked block, best effort.
    ///
    /// Each entry is liveness-probed first; a failed probe means the
    /// process exited or the region is already gone, and the entry is
    /// dropped without a free call. Free failures are logged and the entry
    /// is dropped anyway, so the table is always empty afterwards and a
    /// second call is a no-op.
    pub fn free_all<P: ProcessMemory>(&mut self, process: &P) {
        for block in self.blocks.drain(..) {
            if !process.is_alive_at(block.addr) {
                debug!(
                    "Skipping {} '{}' at {:#x}: not reachable",
                    block.purpose, block.name, block.addr
                );
                continue;
            }
            if let Err(e) = process.free(block.addr) {
                warn!(
                    "Failed to free {} '{}' at {:#x}: {}",
                    block.purpose, block.name, block.addr, e
                );
            }
        }
    }

    pub fn blocks(&self) -> &[TrackedBlock] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
