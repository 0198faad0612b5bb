//! Read-only decoding of the target runtime's collections and strings.
//!
//! Everything here is re-read on every synchronization tick, so decode
//! failures caused by a dying target are routine: strings degrade to
//! empty, obscured integers to zero, and only structurally impossible
//! data (a count past the sanity bound) surfaces as an error.
//!
//! The one deliberate exception to "read-only" is [`ClrReader::drain_list`],
//! used on lists the target treats as event queues: without zeroing the
//! count, already-consumed notifications would be re-delivered every tick.

pub mod layout;

use encoding_rs::UTF_16LE;
use tracing::debug;

use crate::error::{Error, Result};
use crate::process::ProcessMemory;

use layout::{MAX_COLLECTION_COUNT, array, dict, list, obscured, string};

/// Pointer width of the target runtime. Every shipping build of the
/// target is 64-bit; the 32-bit paths survive for catalogue work against
/// old dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointerWidth {
    Bits32,
    #[default]
    Bits64,
}

/// A decoded fixed array / list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClrList {
    pub items: Vec<u64>,
}

/// One dictionary entry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClrDictEntry {
    pub hash_code: u32,
    pub next_index: i32,
    pub key: u64,
    pub value: u64,
}

impl ClrDictEntry {
    /// Removed/free slot: present in the entry array, skippable by
    /// consumers.
    pub fn is_removed(&self) -> bool {
        self.hash_code == dict::REMOVED_ENTRY_HASH
    }
}

/// A decoded dictionary: the raw entry records plus the declared count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClrDict {
    pub entries: Vec<ClrDictEntry>,
    pub count: u32,
}

impl ClrDict {
    /// Live entries only.
    pub fn live_entries(&self) -> impl Iterator<Item = &ClrDictEntry> {
        self.entries.iter().filter(|e| !e.is_removed())
    }
}

/// Decoder over a target process.
#[derive(Debug, Clone, Copy)]
pub struct ClrReader<'a, P> {
    process: &'a P,
}

impl<'a, P: ProcessMemory> ClrReader<'a, P> {
    pub fn new(process: &'a P) -> Self {
        Self { process }
    }

    fn sane_count(&self, address: u64, count: u32, what: &str) -> Result<()> {
        if count > MAX_COLLECTION_COUNT {
            return Err(Error::DecodeFailed {
                address,
                message: format!("{what} declares {count} entries"),
            });
        }
        Ok(())
    }

    /// Decode a fixed array: 4-byte count, then pointer-sized entries.
    ///
    /// Null entries are dropped unless `keep_none`, which is needed when
    /// slot position encodes meaning, like inventory indices.
    pub fn read_list(&self, address: u64, keep_none: bool) -> Result<ClrList> {
        let count = self.process.read_u32(address + array::COUNT_OFFSET)?;
        if count == 0 {
            return Ok(ClrList::default());
        }
        self.sane_count(address, count, "array")?;

        let raw = self
            .process
            .read_exact(address + array::FIRST_ITEM_OFFSET, count as usize * 8)?;

        let mut items = Vec::with_capacity(count as usize);
        for chunk in raw.chunks_exact(8) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            let item = u64::from_le_bytes(bytes);
            if item == 0 && !keep_none {
                continue;
            }
            items.push(item);
        }
        Ok(ClrList { items })
    }

    /// Decode a growable list: one indirection to its backing array.
    pub fn read_generic_list(&self, address: u64, keep_none: bool) -> Result<ClrList> {
        let backing = self.process.read_ptr(address + list::BACKING_ARRAY_OFFSET)?;
        if backing == 0 {
            return Ok(ClrList::default());
        }
        self.read_list(backing, keep_none)
    }

    /// Decode a hash-bucketed dictionary.
    ///
    /// Removed slots (`hash == 0xFFFFFFFF`) stay in the raw decode; use
    /// [`ClrDict::live_entries`] to skip them.
    pub fn read_dict(&self, address: u64, width: PointerWidth) -> Result<ClrDict> {
        let header = match width {
            PointerWidth::Bits32 => dict::HEADER_LEN_32,
            PointerWidth::Bits64 => dict::HEADER_LEN_64,
        };

        let entries_ptr_offset = header + dict::BUCKETS_PTR_LEN;
        let count_offset = entries_ptr_offset + dict::ENTRIES_PTR_LEN;

        let count = self.process.read_u32(address + count_offset)?;
        self.sane_count(address, count, "dictionary")?;
        if count == 0 {
            return Ok(ClrDict::default());
        }

        let entries_addr = self.process.read_ptr(address + entries_ptr_offset)?;
        let raw = self.process.read_exact(
            entries_addr + dict::ENTRY_ARRAY_FIRST_ITEM_OFFSET,
            dict::ENTRY_LEN * count as usize,
        )?;

        let mut entries = Vec::with_capacity(count as usize);
        for record in raw.chunks_exact(dict::ENTRY_LEN) {
            entries.push(ClrDictEntry {
                hash_code: u32::from_le_bytes(record[0..4].try_into().unwrap()),
                next_index: i32::from_le_bytes(record[4..8].try_into().unwrap()),
                key: u64::from_le_bytes(record[8..16].try_into().unwrap()),
                value: u64::from_le_bytes(record[16..24].try_into().unwrap()),
            });
        }

        Ok(ClrDict { entries, count })
    }

    /// Decode a UTF-16 string object. Best-effort telemetry: a null
    /// address, a zero count or any read failure yields an empty string.
    pub fn read_string(&self, address: u64) -> String {
        self.read_string_with(address, PointerWidth::Bits64)
    }

    pub fn read_string_with(&self, address: u64, width: PointerWidth) -> String {
        if address == 0 {
            return String::new();
        }

        let header = match width {
            PointerWidth::Bits32 => string::HEADER_LEN_32,
            PointerWidth::Bits64 => string::HEADER_LEN_64,
        };

        let Ok(char_count) = self.process.read_u32(address + header) else {
            return String::new();
        };
        if char_count == 0 || char_count > MAX_COLLECTION_COUNT {
            return String::new();
        }

        let Ok(raw) = self.process.read_exact(
            address + header + string::CHAR_COUNT_LEN,
            char_count as usize * 2,
        ) else {
            debug!("String read at {:#x} failed mid-decode", address);
            return String::new();
        };

        let (decoded, _, _) = UTF_16LE.decode(&raw);
        decoded.into_owned()
    }

    /// Decode an XOR-obscured integer cell.
    ///
    /// Flag byte clear (or unreadable) decodes to zero, matching the
    /// target's own semantics for never-written cells.
    pub fn read_obscured_int(&self, address: u64) -> i32 {
        let present = self
            .process
            .read_u8(address + obscured::PRESENT_FLAG_OFFSET)
            .unwrap_or(0);
        if present == 0 {
            return 0;
        }

        let key = match self.process.read_u32(address + obscured::KEY_OFFSET) {
            Ok(v) => v,
            Err(_) => return 0,
        };
        let encrypted = match self.process.read_u32(address + obscured::ENCRYPTED_OFFSET) {
            Ok(v) => v,
            Err(_) => return 0,
        };
        (key ^ encrypted) as i32
    }

    /// Mark an event-queue list as consumed by zeroing its count, so the
    /// target stops re-delivering entries the controller already took.
    pub fn drain_list(&self, address: u64) -> Result<()> {
        self.process.write_u32(address + array::COUNT_OFFSET, 0)
    }
}
