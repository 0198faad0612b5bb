//! Engine orchestration: attach, resolve, inject, drive, restore.
//!
//! One engine instance owns one attached target for its whole lifetime.
//! Start-up runs resolve -> allocate -> compile -> install and aborts
//! entirely on any failure, unwinding whatever was already written: a
//! partially instrumented target is worse than an uninstrumented one.
//! Shutdown reverses everything and tolerates a target that already
//! exited.
//!
//! Dispatch per target build is static: the build differences live in the
//! function catalogue and the offset cache, not in trait objects.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::arena::{DEFAULT_BLOCK_SIZE, MemoryArena, SlotPurpose};
use crate::call::{CallCell, DEFAULT_CALL_TIMEOUT, DEFAULT_POLL_INTERVAL};
use crate::clr::ClrReader;
use crate::error::{Error, Result};
use crate::inject::{FunctionCatalog, InjectionSet, RSP_CACHE_PARAM};
use crate::offset::{OffsetCache, try_load_cached_offsets};
use crate::process::ProcessMemory;
use crate::scan::{ScanOptions, scan_process};

/// Parameter cell the remote-call protocol polls and posts through.
pub const TARGET_FUNC_PARAM: &str = "ptr_target_func";

/// How far past the module base function signatures are scanned. Covers
/// the code section of every known build.
const MODULE_SCAN_SPAN: u64 = 0x4000_0000;

/// Engine configuration.
///
/// `pointer_params` are 8-byte cells carved from one block, holding the
/// addresses the synchronizer and the templates pass across the process
/// boundary.
/// `data_params` each get a full scratch block for staged payloads
/// (coordinates, text).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Module the catalogue's signatures and offsets are relative to.
    pub module_name: String,
    /// Target build, used to key the offset cache.
    pub build_version: String,
    /// Offset cache location; `None` disables caching.
    pub offset_cache_path: Option<PathBuf>,
    pub pointer_params: Vec<String>,
    pub data_params: Vec<String>,
    pub poll_interval: Duration,
    pub call_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            module_name: "GameAssembly.dll".to_string(),
            build_version: String::new(),
            offset_cache_path: None,
            pointer_params: Vec::new(),
            data_params: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// An attached, instrumentable target.
pub struct Engine<P: ProcessMemory> {
    process: P,
    config: EngineConfig,
    catalog: FunctionCatalog,
    arena: MemoryArena,
    injections: InjectionSet,
    call_cell: Option<CallCell>,
    params: HashMap<String, u64>,
    addresses: HashMap<String, u64>,
    module_base: u64,
    started: bool,
}

impl<P: ProcessMemory> Engine<P> {
    pub fn new(process: P, catalog: FunctionCatalog, config: EngineConfig) -> Self {
        Self {
            process,
            config,
            catalog,
            arena: MemoryArena::new(),
            injections: InjectionSet::new(),
            call_cell: None,
            params: HashMap::new(),
            addresses: HashMap::new(),
            module_base: 0,
            started: false,
        }
    }

    pub fn process(&self) -> &P {
        &self.process
    }

    /// Decoder over this engine's target.
    pub fn decoder(&self) -> ClrReader<'_, P> {
        ClrReader::new(&self.process)
    }

    /// Address of a parameter cell or data slot, for callers staging
    /// writes before an invoke.
    pub fn param_addr(&self, name: &str) -> Option<u64> {
        self.params.get(name).copied()
    }

    /// Resolved absolute address of a catalogue function.
    pub fn function_addr(&self, code: &str) -> Option<u64> {
        self.addresses.get(code).copied()
    }

    /// Resolve, allocate, compile and install everything.
    pub fn start(&mut self, module_base: u64) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        self.module_base = module_base;

        if let Err(e) = self.try_start() {
            warn!("Engine start failed, unwinding: {}", e);
            self.injections.teardown(&self.process);
            self.arena.free_all(&self.process);
            self.call_cell = None;
            self.params.clear();
            return Err(e);
        }

        self.started = true;
        info!(
            "Engine started: {} functions installed against {} @ {:#x}",
            self.addresses.len(),
            self.config.module_name,
            module_base
        );
        Ok(())
    }

    fn try_start(&mut self) -> Result<()> {
        self.resolve_addresses()?;

        // parameter cells: the call cell and the rsp cache first, then the
        // per-build cells, in declared order
        let mut names: Vec<&str> = vec![TARGET_FUNC_PARAM, RSP_CACHE_PARAM];
        names.extend(self.config.pointer_params.iter().map(String::as_str));
        self.params = self.arena.reserve_pointers(&self.process, &names)?;

        let data_params = self.config.data_params.clone();
        for name in &data_params {
            let slot = self.arena.allocate(
                &self.process,
                DEFAULT_BLOCK_SIZE,
                SlotPurpose::DataSlot,
                name,
            )?;
            self.params.insert(name.clone(), slot);
        }

        self.injections.install(
            &self.process,
            &mut self.arena,
            &self.catalog,
            &self.addresses,
            &self.params,
        )?;

        let cell_addr = self.params[TARGET_FUNC_PARAM];
        // the cell must read idle before the first invoke
        self.process.write_u64(cell_addr, 0)?;
        self.call_cell = Some(CallCell::with_timing(
            cell_addr,
            self.config.poll_interval,
            self.config.call_timeout,
        ));
        Ok(())
    }

    /// Resolve every catalogue function to an absolute address: cached
    /// offsets when valid, signature scan otherwise. A signature must
    /// match exactly once: zero means an absent function, two or more an
    /// ambiguous pattern, and both abort start-up.
    fn resolve_addresses(&mut self) -> Result<()> {
        let cached: HashMap<String, u64> = match &self.config.offset_cache_path {
            Some(path) => try_load_cached_offsets(path, &self.config.build_version)
                .unwrap_or_default(),
            None => HashMap::new(),
        };

        let mut scanned_any = false;
        let mut codes: Vec<&String> = self.catalog.functions.keys().collect();
        codes.sort();

        for code in codes {
            let func = &self.catalog.functions[code];

            if let Some(offset) = cached.get(code) {
                let addr = self.module_base + offset;
                debug!("{}: cached offset {:#x} -> {:#x}", code, offset, addr);
                self.addresses.insert(code.clone(), addr);
                continue;
            }

            let opts = ScanOptions {
                start: self.module_base,
                end: self.module_base.saturating_add(MODULE_SCAN_SPAN),
                max_results: 2,
                ..Default::default()
            };
            let matches = scan_process(&self.process, &func.signature, opts)?;
            if matches.len() != 1 {
                return Err(Error::ScanFailed {
                    code: code.clone(),
                    required: 1,
                    found: matches.len(),
                });
            }

            debug!(
                "{}: signature matched at {:#x} (+{:#x})",
                code,
                matches[0],
                matches[0] - self.module_base
            );
            self.addresses.insert(code.clone(), matches[0]);
            scanned_any = true;
        }

        if scanned_any && let Some(path) = &self.config.offset_cache_path {
            let offsets: HashMap<String, u64> = self
                .addresses
                .iter()
                .map(|(code, addr)| (code.clone(), addr - self.module_base))
                .collect();
            let cache = OffsetCache::new(self.config.build_version.clone(), offsets);
            if let Err(e) = cache.save_to_path(path) {
                warn!("Failed to save offset cache: {}", e);
            }
        }

        Ok(())
    }

    /// Run an installed trigger and wait for the target to complete it.
    pub fn invoke(&self, code: &str, trigger: &str) -> Result<()> {
        self.invoke_with(code, trigger, |_| Ok(()))
    }

    /// Run a trigger with parameter staging. The setup closure runs under
    /// the call-cell exclusion, after the idle wait and before the post,
    /// so staged writes are never observed half-done.
    pub fn invoke_with<F>(&self, code: &str, trigger: &str, setup: F) -> Result<()>
    where
        F: FnOnce(&P) -> Result<()>,
    {
        let cell = self.call_cell.as_ref().ok_or(Error::NotStarted)?;
        let trigger_addr = self.injections.trigger_addr(code, trigger)?;
        cell.invoke_with(&self.process, trigger_addr, setup)
    }

    /// Restore every patched byte and free every scratch block.
    ///
    /// Idempotent; safe against a target that exited at any earlier point.
    pub fn shutdown(&mut self) {
        if !self.started && self.injections.records().is_empty() && self.arena.is_empty() {
            return;
        }
        info!("Engine shutting down");
        self.call_cell = None;
        self.injections.teardown(&self.process);
        self.arena.free_all(&self.process);
        self.params.clear();
        self.started = false;
    }
}

impl<P: ProcessMemory> Drop for Engine<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
