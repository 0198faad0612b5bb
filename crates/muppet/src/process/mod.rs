//! Process memory boundary.
//!
//! Everything above this module works against the [`ProcessMemory`] trait so
//! the scanner, arena, injector and decoders can run against an in-memory
//! mock in tests. The real implementation ([`WindowsProcess`]) wraps the
//! Win32 virtual-memory and Toolhelp APIs.
//!
//! The target process can exit at any moment, so every operation returns a
//! `Result`; callers decide whether an access failure is fatal (setup) or
//! routine (teardown, polling).

#[cfg(target_os = "windows")]
mod windows;

#[cfg(test)]
pub mod mock;

#[cfg(target_os = "windows")]
pub use windows::WindowsProcess;

#[cfg(test)]
pub use mock::{MockProcess, MockProcessBuilder};

use crate::error::{Error, Result};

/// One span of target address space as reported by the region query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub size: u64,
    pub committed: bool,
    pub readable: bool,
}

impl MemoryRegion {
    /// End address (exclusive).
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    pub fn is_scannable(&self) -> bool {
        self.committed && self.readable && self.size > 0
    }
}

/// Page protection requested for scratch allocations.
///
/// Stub slots need `ExecuteReadWrite`; parameter slots get by with
/// `ReadWrite` but the original controller allocated everything RWX, so
/// that stays the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
    ExecuteRead,
    #[default]
    ExecuteReadWrite,
}

/// Read/write/allocate access to a target process.
///
/// Addresses are always absolute addresses inside the target, never
/// pointers valid in the controller.
pub trait ProcessMemory {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<()>;

    /// Allocate committed memory inside the target. `address` pins the
    /// allocation when given; the OS chooses otherwise.
    fn allocate(&self, size: usize, address: Option<u64>, protection: Protection) -> Result<u64>;

    fn free(&self, address: u64) -> Result<()>;

    /// Query the region containing `address`. `None` means the address is
    /// past the last queryable region.
    fn query_region(&self, address: u64) -> Option<MemoryRegion>;

    /// 1-byte probe used before every destructive teardown step. A probe
    /// failure means the process exited or the region was already released.
    fn is_alive_at(&self, address: u64) -> bool {
        self.read_bytes(address, 1).is_ok()
    }

    fn read_u8(&self, address: u64) -> Result<u8> {
        let bytes = self.read_exact(address, 1)?;
        Ok(bytes[0])
    }

    fn read_u32(&self, address: u64) -> Result<u32> {
        let bytes = self.read_exact(address, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i32(&self, address: u64) -> Result<i32> {
        Ok(self.read_u32(address)? as i32)
    }

    fn read_u64(&self, address: u64) -> Result<u64> {
        let bytes = self.read_exact(address, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Pointer-sized read; the targets handled here are 64-bit.
    fn read_ptr(&self, address: u64) -> Result<u64> {
        self.read_u64(address)
    }

    /// Follow a pointer chain: read a pointer at `address`, then for each
    /// offset dereference `value + offset`. Returns the final value.
    fn read_ptr_chain(&self, address: u64, offsets: &[u64]) -> Result<u64> {
        let mut value = self.read_ptr(address)?;
        for offset in offsets {
            value = self.read_ptr(value.wrapping_add(*offset))?;
        }
        Ok(value)
    }

    fn write_u64(&self, address: u64, value: u64) -> Result<()> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    fn write_u32(&self, address: u64, value: u32) -> Result<()> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    /// Read exactly `size` bytes or fail; short reads are access errors.
    fn read_exact(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let bytes = self.read_bytes(address, size)?;
        if bytes.len() < size {
            return Err(Error::MemoryReadFailed {
                address,
                message: format!("short read: {} of {} bytes", bytes.len(), size),
            });
        }
        Ok(bytes)
    }
}

/// Encode a string the way the target's runtime stores inline text:
/// UTF-16LE with a double-zero terminator.
pub fn encode_utf16z(text: &str) -> Vec<u8> {
    let mut out: Vec<u8> = text.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    out.extend_from_slice(&[0, 0]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::mock::MockProcessBuilder;

    #[test]
    fn typed_reads_are_little_endian() {
        let process = MockProcessBuilder::new()
            .region(0x1000, vec![0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0])
            .build();

        assert_eq!(process.read_u32(0x1000).unwrap(), 0x1234_5678);
        assert_eq!(process.read_u64(0x1000).unwrap(), 0x1234_5678);
        assert_eq!(process.read_u8(0x1003).unwrap(), 0x12);
    }

    #[test]
    fn pointer_chain_follows_offsets() {
        // 0x1000 -> 0x2000; [0x2000 + 8] -> 0x3000; [0x3000 + 0] -> 42
        let process = MockProcessBuilder::new()
            .region(0x1000, 0x2000u64.to_le_bytes().to_vec())
            .region(0x2000, {
                let mut bytes = vec![0u8; 16];
                bytes[8..16].copy_from_slice(&0x3000u64.to_le_bytes());
                bytes
            })
            .region(0x3000, 42u64.to_le_bytes().to_vec())
            .build();

        assert_eq!(process.read_ptr_chain(0x1000, &[8, 0]).unwrap(), 42);
    }

    #[test]
    fn read_past_region_fails() {
        let process = MockProcessBuilder::new().region(0x1000, vec![0; 8]).build();
        assert!(process.read_u64(0x2000).is_err());
        assert!(!process.is_alive_at(0x2000));
        assert!(process.is_alive_at(0x1004));
    }

    #[test]
    fn utf16_encoding_appends_terminator() {
        let bytes = encode_utf16z("Ab");
        assert_eq!(bytes, vec![0x41, 0x00, 0x42, 0x00, 0x00, 0x00]);
    }
}
