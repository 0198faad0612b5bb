//! In-memory stand-in for a target process, used by unit tests.
//!
//! Regions can be marked dead individually (or all at once) to simulate a
//! target that exited mid-operation; reads and writes into dead regions
//! fail exactly like `ReadProcessMemory` against a vanished process.

use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::process::{MemoryRegion, ProcessMemory, Protection};

#[derive(Debug)]
struct MockRegion {
    base: u64,
    bytes: Vec<u8>,
    dead: bool,
    readable: bool,
}

impl MockRegion {
    fn end(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }
}

/// Builder so tests read as a memory map.
#[derive(Debug, Default)]
pub struct MockProcessBuilder {
    regions: Vec<MockRegion>,
}

impl MockProcessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a committed, readable region at `base`.
    pub fn region(mut self, base: u64, bytes: Vec<u8>) -> Self {
        self.regions.push(MockRegion {
            base,
            bytes,
            dead: false,
            readable: true,
        });
        self
    }

    /// Add a committed region that the region query reports as unreadable
    /// (guard pages, PAGE_NOACCESS).
    pub fn unreadable_region(mut self, base: u64, size: usize) -> Self {
        self.regions.push(MockRegion {
            base,
            bytes: vec![0; size],
            dead: false,
            readable: false,
        });
        self
    }

    pub fn build(mut self) -> MockProcess {
        self.regions.sort_by_key(|r| r.base);
        MockProcess {
            regions: Mutex::new(self.regions),
            next_alloc: Mutex::new(0x7000_0000),
        }
    }
}

/// Fake target process backed by host memory.
#[derive(Debug)]
pub struct MockProcess {
    regions: Mutex<Vec<MockRegion>>,
    next_alloc: Mutex<u64>,
}

impl MockProcess {
    /// Mark the region containing `address` dead: every later access fails.
    pub fn kill_region(&self, address: u64) {
        let mut regions = self.regions.lock().unwrap();
        if let Some(region) = regions.iter_mut().find(|r| r.contains(address)) {
            region.dead = true;
        }
    }

    /// Simulate process exit: every region dies.
    pub fn kill_all(&self) {
        let mut regions = self.regions.lock().unwrap();
        for region in regions.iter_mut() {
            region.dead = true;
        }
    }

    /// Snapshot the bytes of the region containing `address`.
    pub fn region_bytes(&self, address: u64) -> Option<Vec<u8>> {
        let regions = self.regions.lock().unwrap();
        regions
            .iter()
            .find(|r| r.contains(address))
            .map(|r| r.bytes.clone())
    }

    /// Whether an allocation at `address` is still present.
    pub fn has_region(&self, address: u64) -> bool {
        let regions = self.regions.lock().unwrap();
        regions.iter().any(|r| r.contains(address))
    }
}

impl ProcessMemory for MockProcess {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let regions = self.regions.lock().unwrap();
        let region = regions
            .iter()
            .find(|r| r.contains(address) && !r.dead)
            .ok_or(Error::MemoryReadFailed {
                address,
                message: "no committed region".to_string(),
            })?;

        let start = (address - region.base) as usize;
        let end = (start + size).min(region.bytes.len());
        Ok(region.bytes[start..end].to_vec())
    }

    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<()> {
        let mut regions = self.regions.lock().unwrap();
        let region = regions
            .iter_mut()
            .find(|r| r.contains(address) && !r.dead)
            .ok_or(Error::MemoryWriteFailed {
                address,
                message: "no committed region".to_string(),
            })?;

        let start = (address - region.base) as usize;
        if start + data.len() > region.bytes.len() {
            return Err(Error::MemoryWriteFailed {
                address,
                message: "write crosses region end".to_string(),
            });
        }
        region.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn allocate(&self, size: usize, address: Option<u64>, _protection: Protection) -> Result<u64> {
        let base = match address {
            Some(addr) => addr,
            None => {
                let mut next = self.next_alloc.lock().unwrap();
                let base = *next;
                // keep allocations page-spaced so they never touch
                *next += ((size as u64 + 0xFFF) & !0xFFF) + 0x1000;
                base
            }
        };

        let mut regions = self.regions.lock().unwrap();
        regions.push(MockRegion {
            base,
            bytes: vec![0; size],
            dead: false,
            readable: true,
        });
        regions.sort_by_key(|r| r.base);
        Ok(base)
    }

    fn free(&self, address: u64) -> Result<()> {
        let mut regions = self.regions.lock().unwrap();
        let index = regions
            .iter()
            .position(|r| r.base == address && !r.dead)
            .ok_or(Error::FreeFailed {
                address,
                message: "no allocation at address".to_string(),
            })?;
        regions.remove(index);
        Ok(())
    }

    fn query_region(&self, address: u64) -> Option<MemoryRegion> {
        let regions = self.regions.lock().unwrap();

        if let Some(region) = regions.iter().find(|r| r.contains(address)) {
            return Some(MemoryRegion {
                base: region.base,
                size: region.bytes.len() as u64,
                committed: !region.dead,
                readable: region.readable && !region.dead,
            });
        }

        // Uncommitted gap: report a free span up to the next region, the
        // way VirtualQueryEx reports MEM_FREE.
        let next = regions.iter().find(|r| r.base > address)?;
        Some(MemoryRegion {
            base: address,
            size: next.base - address,
            committed: false,
            readable: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn killed_region_fails_reads_but_keeps_neighbors() {
        let process = MockProcessBuilder::new()
            .region(0x1000, vec![1; 16])
            .region(0x2000, vec![2; 16])
            .build();

        process.kill_region(0x1000);
        assert!(process.read_bytes(0x1008, 1).is_err());
        assert_eq!(process.read_bytes(0x2008, 1).unwrap(), vec![2]);
    }

    #[test]
    fn allocations_are_disjoint_and_freeable() {
        let process = MockProcessBuilder::new().build();
        let a = process.allocate(2048, None, Protection::default()).unwrap();
        let b = process.allocate(2048, None, Protection::default()).unwrap();
        assert_ne!(a, b);

        process.write_u64(a, 7).unwrap();
        assert_eq!(process.read_u64(a).unwrap(), 7);

        process.free(a).unwrap();
        assert!(process.read_bytes(a, 1).is_err());
        assert!(process.free(a).is_err());
        process.free(b).unwrap();
    }

    #[test]
    fn gap_query_reports_free_span() {
        let process = MockProcessBuilder::new()
            .region(0x1000, vec![0; 0x100])
            .region(0x4000, vec![0; 0x100])
            .build();

        let gap = process.query_region(0x1100).unwrap();
        assert!(!gap.committed);
        assert_eq!(gap.base, 0x1100);
        assert_eq!(gap.end(), 0x4000);

        assert!(process.query_region(0x9000).is_none());
    }
}
