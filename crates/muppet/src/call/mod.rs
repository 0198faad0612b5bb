//! The busy-wait handshake used to run injected triggers.
//!
//! A single pointer cell in the arena is both an advisory mutex and a
//! command queue of depth one. The controller writes a trigger address
//! into it; a spliced callback in the target's own update loop notices the
//! non-zero cell, calls the function it points at, and clears the cell.
//! The target never knows it is being driven.
//!
//! Because parameter slots are shared, the whole sequence (wait for idle,
//! stage parameters, post the trigger, wait for completion) must be
//! exclusive. A controller-side mutex serializes local callers; the cell
//! itself serializes against the target.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::process::ProcessMemory;

/// Delay between cell polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Bound on each wait. The source this protocol was lifted from would poll
/// forever if the target crashed mid-call; a bounded wait turns that hang
/// into a reportable error.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// The shared "target function pointer" cell.
#[derive(Debug)]
pub struct CallCell {
    cell_addr: u64,
    poll_interval: Duration,
    timeout: Duration,
    lock: Mutex<()>,
}

impl CallCell {
    pub fn new(cell_addr: u64) -> Self {
        Self::with_timing(cell_addr, DEFAULT_POLL_INTERVAL, DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_timing(cell_addr: u64, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            cell_addr,
            poll_interval,
            timeout,
            lock: Mutex::new(()),
        }
    }

    pub fn addr(&self) -> u64 {
        self.cell_addr
    }

    /// Run `trigger_addr` in the target and wait for completion.
    pub fn invoke<P: ProcessMemory>(&self, process: &P, trigger_addr: u64) -> Result<()> {
        self.invoke_with(process, trigger_addr, |_| Ok(()))
    }

    /// Run a trigger with staged parameters.
    ///
    /// `setup` performs the parameter-slot writes. It runs strictly after
    /// the idle wait and strictly before the cell write, so the target can
    /// only observe fully staged parameters; a setup failure aborts the
    /// call before anything was posted.
    pub fn invoke_with<P, F>(&self, process: &P, trigger_addr: u64, setup: F) -> Result<()>
    where
        P: ProcessMemory,
        F: FnOnce(&P) -> Result<()>,
    {
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // wait for any in-flight call to finish
        self.wait_clear(process, trigger_addr)?;

        setup(process)?;

        trace!("Posting trigger {:#x}", trigger_addr);
        process.write_u64(self.cell_addr, trigger_addr)?;

        // wait for the target to execute and clear the cell
        self.wait_clear(process, trigger_addr)?;
        debug!("Trigger {:#x} completed", trigger_addr);
        Ok(())
    }

    /// Poll until the cell reads zero.
    ///
    /// A read failure resolves the wait instead of erroring: the target is
    /// gone, there is nothing left to be exclusive against, and the caller
    /// finds out on its next write.
    fn wait_clear<P: ProcessMemory>(&self, process: &P, trigger_addr: u64) -> Result<()> {
        let deadline = Instant::now() + self.timeout;

        loop {
            match process.read_u64(self.cell_addr) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(_) => {
                    debug!("Call cell unreachable; treating wait as resolved");
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::CallTimeout {
                    trigger: trigger_addr,
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}
