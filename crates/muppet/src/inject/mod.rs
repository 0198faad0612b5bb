//! Injection lifecycle: allocate, compile, write, restore, free.
//!
//! Per function: `Planned -> Allocated -> Compiled -> Installed`, then at
//! shutdown `Restored` (original bytes written back) and the arena frees
//! the slots. The invariant that makes rollback safe: original bytes are
//! recorded strictly before the first write to their address, and every
//! teardown step is guarded by a liveness probe because the target can
//! exit at any moment.

mod catalog;
mod compile;

pub use catalog::{
    CallbackSpec, FunctionCatalog, GameFunction, PatchSpec, TriggerSpec, load_catalog,
    save_catalog,
};
pub use compile::{
    CompiledCallback, RSP_CACHE_PARAM, callback_patch_span, compile_callback, compile_patch,
    compile_trigger, patch_span,
};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::arena::{DEFAULT_BLOCK_SIZE, MemoryArena, SlotPurpose};
use crate::error::{Error, Result};
use crate::process::ProcessMemory;

/// Rollback entry: what was at `address` before the first write.
#[derive(Debug, Clone)]
pub struct InjectionRecord {
    pub address: u64,
    pub original: Vec<u8>,
    pub recorded_at: DateTime<Utc>,
}

/// Addresses of the stubs installed for one function.
#[derive(Debug, Clone, Default)]
pub struct InstalledFunction {
    pub address: u64,
    pub triggers: HashMap<String, u64>,
    pub callbacks: HashMap<String, u64>,
}

/// All installed state for one engine instance.
#[derive(Debug, Default)]
pub struct InjectionSet {
    records: Vec<InjectionRecord>,
    installed: HashMap<String, InstalledFunction>,
}

impl InjectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install every trigger, callback and patch in the catalogue.
    ///
    /// `addresses` maps function codes to their resolved addresses;
    /// `params` holds the shared template parameters (pointer cells, data
    /// slots). A function without a resolved address is fatal: partial
    /// injection is unsafe, so the caller aborts start-up and tears down
    /// whatever was already written.
    pub fn install<P: ProcessMemory>(
        &mut self,
        process: &P,
        arena: &mut MemoryArena,
        catalog: &FunctionCatalog,
        addresses: &HashMap<String, u64>,
        params: &HashMap<String, u64>,
    ) -> Result<()> {
        // deterministic install order keeps logs and failures reproducible
        let mut codes: Vec<&String> = catalog.functions.keys().collect();
        codes.sort();

        for code in codes {
            let func = &catalog.functions[code];
            let func_addr = *addresses
                .get(code)
                .ok_or_else(|| Error::MissingFunctionOffset(code.clone()))?;

            let mut func_params = params.clone();
            func_params.insert("game_func".to_string(), func_addr);

            let mut installed = InstalledFunction {
                address: func_addr,
                ..Default::default()
            };

            for (name, spec) in &func.triggers {
                let slot = arena.allocate(
                    process,
                    DEFAULT_BLOCK_SIZE,
                    SlotPurpose::TriggerSlot,
                    &format!("{code}:{name}"),
                )?;
                let bytes = compile::compile_trigger(spec, &func_params)?;
                process.write_bytes(slot, &bytes)?;
                debug!("Installed trigger {}:{} at {:#x}", code, name, slot);
                installed.triggers.insert(name.clone(), slot);
            }

            for (name, spec) in &func.callbacks {
                let slot = arena.allocate(
                    process,
                    DEFAULT_BLOCK_SIZE,
                    SlotPurpose::CallbackSlot,
                    &format!("{code}:{name}"),
                )?;

                let span = compile::callback_patch_span(func, slot)?;
                let patch_addr = func_addr + spec.offset;
                let original = process.read_exact(patch_addr, span)?;

                let compiled =
                    compile::compile_callback(func, spec, slot, func_addr, &func_params, &original)?;

                process.write_bytes(slot, &compiled.callback_bytes)?;
                // record before the in-place write; the stub write above
                // only touched controller-owned scratch
                self.records.push(InjectionRecord {
                    address: patch_addr,
                    original,
                    recorded_at: Utc::now(),
                });
                process.write_bytes(patch_addr, &compiled.patch_bytes)?;

                debug!(
                    "Spliced callback {}:{} at {:#x} (+{:#x}, {} bytes)",
                    code, name, slot, spec.offset, span
                );
                installed.callbacks.insert(name.clone(), slot);
            }

            for (name, spec) in &func.patches {
                let bytes = compile::compile_patch(func, spec, &func_params)?;
                let patch_addr = func_addr + spec.offset;
                let original = process.read_exact(patch_addr, bytes.len())?;

                self.records.push(InjectionRecord {
                    address: patch_addr,
                    original,
                    recorded_at: Utc::now(),
                });
                process.write_bytes(patch_addr, &bytes)?;

                debug!(
                    "Patched {}:{} at {:#x} ({} bytes)",
                    code, name, patch_addr, bytes.len()
                );
            }

            self.installed.insert(code.clone(), installed);
        }

        info!(
            "Installed {} functions, {} rollback records",
            self.installed.len(),
            self.records.len()
        );
        Ok(())
    }

    /// Address of an installed trigger stub.
    pub fn trigger_addr(&self, code: &str, trigger: &str) -> Result<u64> {
        self.installed
            .get(code)
            .and_then(|f| f.triggers.get(trigger))
            .copied()
            .ok_or_else(|| Error::MissingTrigger {
                code: code.to_string(),
                trigger: trigger.to_string(),
            })
    }

    pub fn installed(&self, code: &str) -> Option<&InstalledFunction> {
        self.installed.get(code)
    }

    pub fn records(&self) -> &[InjectionRecord] {
        &self.records
    }

    /// Restore original bytes everywhere, best effort.
    ///
    /// Every record is attempted even when earlier ones fail; a dead
    /// liveness probe skips the write, a failed write is logged. The
    /// record table is cleared, so a second teardown is a no-op.
    pub fn teardown<P: ProcessMemory>(&mut self, process: &P) {
        for record in self.records.drain(..) {
            if !process.is_alive_at(record.address) {
                debug!(
                    "Skipping restore at {:#x}: not reachable",
                    record.address
                );
                continue;
            }
            if let Err(e) = process.write_bytes(record.address, &record.original) {
                warn!("Failed to restore bytes at {:#x}: {}", record.address, e);
            }
        }
        self.installed.clear();
    }
}
