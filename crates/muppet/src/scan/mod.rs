//! Byte-signature scanning over files and live process memory.
//!
//! Signatures are the classic AOB form: hex bytes with `??` wildcards
//! (`"48 8B ?? 89 05"`). Scanning streams the source in bounded chunks and
//! carries a `pattern_len - 1` overlap so matches straddling a chunk
//! boundary are not lost.
//!
//! Finding nothing is a normal outcome: scans return an empty list, and
//! only the caller that required a match escalates it to an error.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::process::ProcessMemory;

/// Default streaming chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Highest user-space address worth scanning on 64-bit Windows.
const MAX_USER_ADDRESS: u64 = 0x7FFF_FFFF_FFFF;

/// A byte pattern with wildcard positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature(Vec<Option<u8>>);

impl Signature {
    /// Parse a pattern like `"48 8D 0D ?? ?? ?? ??"`. Whitespace between
    /// tokens is optional padding; `?` is accepted as a wildcard alias.
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut bytes = Vec::new();
        for token in pattern.split_whitespace() {
            if token == "??" || token == "?" {
                bytes.push(None);
                continue;
            }
            let value = u8::from_str_radix(token, 16).map_err(|e| {
                Error::InvalidPattern(format!("invalid token '{token}': {e}"))
            })?;
            bytes.push(Some(value));
        }

        if bytes.is_empty() {
            return Err(Error::InvalidPattern("pattern is empty".to_string()));
        }
        Ok(Self(bytes))
    }

    pub fn from_parts(parts: Vec<Option<u8>>) -> Self {
        Self(parts)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parts(&self) -> &[Option<u8>] {
        &self.0
    }

    /// Exact byte positions, precomputed once per scan so the inner loop
    /// only touches non-wildcard offsets.
    fn anchors(&self) -> Vec<(usize, u8)> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.map(|v| (i, v)))
            .collect()
    }

    /// Exact byte form when the pattern carries no wildcards, enabling the
    /// memchr fast path.
    fn exact_bytes(&self) -> Option<Vec<u8>> {
        self.0.iter().copied().collect()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .0
            .iter()
            .map(|b| match b {
                Some(value) => format!("{value:02X}"),
                None => "??".to_string(),
            })
            .collect();
        write!(f, "{}", rendered.join(" "))
    }
}

impl TryFrom<String> for Signature {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Signature::parse(&value)
    }
}

impl From<Signature> for String {
    fn from(value: Signature) -> Self {
        value.to_string()
    }
}

/// Bounds and limits for one scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub start: u64,
    pub end: u64,
    pub max_results: usize,
    pub chunk_size: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            start: 0,
            end: MAX_USER_ADDRESS,
            max_results: 1,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ScanOptions {
    pub fn with_max_results(max_results: usize) -> Self {
        Self {
            max_results,
            ..Self::default()
        }
    }

    pub fn bounded(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            ..Self::default()
        }
    }
}

/// Incremental matcher shared by the file and process scans. Carries the
/// last match across chunk feeds so the overlap-exclusion rule holds
/// globally: once a match is reported at `a`, nothing at an address
/// `<= a + pattern_len` is reported again.
struct Matcher {
    anchors: Vec<(usize, u8)>,
    exact: Option<Vec<u8>>,
    pattern_len: usize,
    max_results: usize,
    last_match: Option<u64>,
    results: Vec<u64>,
}

impl Matcher {
    fn new(signature: &Signature, max_results: usize) -> Self {
        Self {
            anchors: signature.anchors(),
            exact: signature.exact_bytes(),
            pattern_len: signature.len(),
            max_results,
            last_match: None,
            results: Vec::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.results.len() >= self.max_results
    }

    fn accept(&mut self, address: u64) -> bool {
        if let Some(last) = self.last_match
            && address <= last + self.pattern_len as u64
        {
            return false;
        }
        self.last_match = Some(address);
        self.results.push(address);
        self.is_full()
    }

    /// Scan one buffer that starts at `base`. Returns true when
    /// `max_results` has been reached.
    fn feed(&mut self, buffer: &[u8], base: u64) -> bool {
        if self.is_full() || buffer.len() < self.pattern_len {
            return self.is_full();
        }

        if let Some(needle) = &self.exact {
            let positions: Vec<usize> =
                memchr::memmem::find_iter(buffer, needle).collect();
            for pos in positions {
                if self.accept(base + pos as u64) {
                    return true;
                }
            }
            return false;
        }

        let last_offset = buffer.len() - self.pattern_len;
        'outer: for offset in 0..=last_offset {
            let address = base + offset as u64;
            if let Some(last) = self.last_match
                && address <= last + self.pattern_len as u64
            {
                continue;
            }
            for (pos, value) in &self.anchors {
                if buffer[offset + pos] != *value {
                    continue 'outer;
                }
            }
            if self.accept(address) {
                return true;
            }
        }
        false
    }

    fn finish(self) -> Vec<u64> {
        self.results
    }
}

/// Scan a file on disk, streaming `chunk_size` windows. Returned addresses
/// are file offsets.
pub fn scan_file<P: AsRef<Path>>(
    path: P,
    signature: &Signature,
    opts: ScanOptions,
) -> Result<Vec<u64>> {
    let mut file = File::open(path.as_ref())?;
    let mut matcher = Matcher::new(signature, opts.max_results);

    let overlap = signature.len().saturating_sub(1);
    let mut buffer = vec![0u8; opts.chunk_size + overlap];
    let mut tail_len = 0usize;
    // offset of buffer[0] within the file
    let mut window_base = 0u64;

    loop {
        let read = file.read(&mut buffer[tail_len..])?;
        if read == 0 {
            break;
        }
        let filled = tail_len + read;

        if matcher.feed(&buffer[..filled], window_base) {
            break;
        }

        // carry the last pattern_len - 1 bytes into the next window
        tail_len = overlap.min(filled);
        window_base += (filled - tail_len) as u64;
        buffer.copy_within(filled - tail_len..filled, 0);
    }

    Ok(matcher.finish())
}

/// Scan a target process's committed, readable memory.
///
/// Regions are enumerated through the region query; non-committed and
/// non-readable spans are skipped whole. A read failure inside a region
/// (pages released mid-scan) skips the rest of that region rather than
/// failing the scan.
pub fn scan_process<P: ProcessMemory>(
    process: &P,
    signature: &Signature,
    opts: ScanOptions,
) -> Result<Vec<u64>> {
    let mut matcher = Matcher::new(signature, opts.max_results);
    let overlap = signature.len().saturating_sub(1);

    let mut current = opts.start;
    while current < opts.end && !matcher.is_full() {
        let Some(region) = process.query_region(current) else {
            break;
        };
        // Region bases can be below the cursor when the cursor points into
        // the middle of one; always advance past the region end.
        let next = region.end().max(current + 1);

        if region.is_scannable() {
            let scan_end = region.end().min(opts.end);
            let mut pos = current.max(region.base);

            while pos < scan_end && !matcher.is_full() {
                let want = (opts.chunk_size + overlap).min((scan_end - pos) as usize);
                match process.read_bytes(pos, want) {
                    Ok(chunk) => {
                        if matcher.feed(&chunk, pos) {
                            break;
                        }
                    }
                    Err(_) => {
                        debug!(
                            "Scan skipping unreadable chunk at {:#x} (region {:#x})",
                            pos, region.base
                        );
                        break;
                    }
                }
                pos += opts.chunk_size as u64;
            }
        }

        current = next;
    }

    Ok(matcher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MockProcessBuilder;
    use std::io::Write;

    fn sig(pattern: &str) -> Signature {
        Signature::parse(pattern).unwrap()
    }

    #[test]
    fn parse_pattern_with_wildcards() {
        let signature = sig("48 8D 0D ?? ?? ?? ??");
        assert_eq!(signature.len(), 7);
        assert_eq!(signature.parts()[0], Some(0x48));
        assert_eq!(signature.parts()[3], None);
    }

    #[test]
    fn format_pattern_round_trip() {
        let signature = Signature::from_parts(vec![Some(0x48), Some(0x8D), None, Some(0xFF)]);
        let rendered = signature.to_string();
        assert_eq!(rendered, "48 8D ?? FF");
        assert_eq!(Signature::parse(&rendered).unwrap(), signature);
    }

    #[test]
    fn parse_rejects_empty_and_garbage() {
        assert!(Signature::parse("").is_err());
        assert!(Signature::parse("GG 01").is_err());
    }

    #[test]
    fn embedded_pattern_is_found_at_its_offset() {
        let mut bytes = vec![0u8; 256];
        bytes[117..120].copy_from_slice(&[0xDE, 0xAD, 0xBF]);
        let process = MockProcessBuilder::new().region(0x10000, bytes).build();

        let found = scan_process(
            &process,
            &sig("DE AD BF"),
            ScanOptions::with_max_results(4),
        )
        .unwrap();
        assert_eq!(found, vec![0x10000 + 117]);
    }

    #[test]
    fn wildcard_positions_are_skipped_not_zero() {
        // middle byte is 0x90, pattern holds a wildcard there; a zero
        // comparison would reject the match
        let process = MockProcessBuilder::new()
            .region(0x1000, vec![0x11, 0x48, 0x90, 0x89, 0x22])
            .build();

        let found = scan_process(&process, &sig("48 ?? 89"), ScanOptions::default()).unwrap();
        assert_eq!(found, vec![0x1001]);
    }

    #[test]
    fn overlapping_repeats_are_suppressed() {
        // 48 xx 89 appears at offsets 2 and 6; the gap is wide enough that
        // both clear the `last + pattern_len` exclusion
        let bytes = vec![0, 0, 0x48, 0x90, 0x89, 0, 0x48, 0x12, 0x89, 0];
        let process = MockProcessBuilder::new().region(0x2000, bytes).build();

        let found = scan_process(
            &process,
            &sig("48 ?? 89"),
            ScanOptions::with_max_results(2),
        )
        .unwrap();
        assert_eq!(found, vec![0x2002, 0x2006]);

        // adjacent copies inside the exclusion window collapse to one match
        let bytes = vec![0x48, 0x90, 0x89, 0x48, 0x12, 0x89, 0, 0, 0, 0];
        let process = MockProcessBuilder::new().region(0x3000, bytes).build();
        let found = scan_process(
            &process,
            &sig("48 ?? 89"),
            ScanOptions::with_max_results(8),
        )
        .unwrap();
        assert_eq!(found, vec![0x3000]);
    }

    #[test]
    fn results_are_never_closer_than_pattern_len() {
        let mut bytes = vec![0xABu8; 64];
        bytes.extend(vec![0u8; 8]);
        let process = MockProcessBuilder::new().region(0x4000, bytes).build();

        let found = scan_process(
            &process,
            &sig("AB AB AB AB"),
            ScanOptions::with_max_results(16),
        )
        .unwrap();
        for pair in found.windows(2) {
            assert!(pair[1] - pair[0] > 4);
        }
    }

    #[test]
    fn max_results_stops_early() {
        let bytes = [0xCC; 4096]
            .chunks(8)
            .flat_map(|c| {
                let mut v = c.to_vec();
                v[0] = 0x55;
                v
            })
            .collect::<Vec<_>>();
        let process = MockProcessBuilder::new().region(0x5000, bytes).build();

        let found = scan_process(&process, &sig("55 CC"), ScanOptions::with_max_results(3)).unwrap();
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn match_straddling_chunk_boundary_is_caught() {
        let chunk = 64;
        let mut bytes = vec![0u8; 256];
        // plant the pattern across the first chunk edge
        bytes[chunk - 2..chunk + 1].copy_from_slice(&[0xFE, 0xED, 0xFA]);
        let process = MockProcessBuilder::new().region(0x6000, bytes).build();

        let opts = ScanOptions {
            chunk_size: chunk,
            max_results: 1,
            ..Default::default()
        };
        let found = scan_process(&process, &sig("FE ED FA"), opts).unwrap();
        assert_eq!(found, vec![0x6000 + chunk as u64 - 2]);
    }

    #[test]
    fn non_committed_and_unreadable_regions_are_skipped() {
        let mut live = vec![0u8; 64];
        live[10..13].copy_from_slice(&[0xAA, 0xBB, 0xCC]);

        let process = MockProcessBuilder::new()
            .unreadable_region(0x1000, 64)
            .region(0x8000, live)
            .build();

        let found = scan_process(
            &process,
            &sig("AA BB CC"),
            ScanOptions::with_max_results(4),
        )
        .unwrap();
        assert_eq!(found, vec![0x8000 + 10]);
    }

    #[test]
    fn scan_respects_bounds() {
        let mut bytes = vec![0u8; 128];
        bytes[8..10].copy_from_slice(&[0x77, 0x88]);
        bytes[100..102].copy_from_slice(&[0x77, 0x88]);
        let process = MockProcessBuilder::new().region(0x9000, bytes).build();

        let opts = ScanOptions {
            start: 0x9000 + 32,
            end: 0x9000 + 128,
            max_results: 4,
            chunk_size: DEFAULT_CHUNK_SIZE,
        };
        let found = scan_process(&process, &sig("77 88"), opts).unwrap();
        assert_eq!(found, vec![0x9000 + 100]);
    }

    #[test]
    fn absent_pattern_returns_empty_not_error() {
        let process = MockProcessBuilder::new().region(0x1000, vec![0; 64]).build();
        let found = scan_process(&process, &sig("DE AD BE EF"), ScanOptions::default()).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn file_scan_matches_process_scan() {
        let mut bytes = vec![0u8; 300_000];
        bytes[1_234..1_237].copy_from_slice(&[0x01, 0x02, 0x03]);
        bytes[250_007..250_010].copy_from_slice(&[0x01, 0x7F, 0x03]);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();

        let found = scan_file(
            file.path(),
            &sig("01 ?? 03"),
            ScanOptions::with_max_results(4),
        )
        .unwrap();
        assert_eq!(found, vec![1_234, 250_007]);
    }

    #[test]
    fn file_scan_catches_chunk_boundary_match() {
        let chunk = 1024;
        let mut bytes = vec![0u8; 4096];
        bytes[chunk - 1..chunk + 2].copy_from_slice(&[0x10, 0x20, 0x30]);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();

        let opts = ScanOptions {
            chunk_size: chunk,
            max_results: 1,
            ..Default::default()
        };
        let found = scan_file(file.path(), &sig("10 20 30"), opts).unwrap();
        assert_eq!(found, vec![chunk as u64 - 1]);
    }
}
