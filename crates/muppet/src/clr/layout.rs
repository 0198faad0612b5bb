//! Memory layout constants for the target runtime's built-in types.
//!
//! Reverse-engineered, not documented: these mirror the Mono/CLR object
//! layouts the target build ships with, and they drift between runtime
//! versions. Offsets are from the object's base address.

/// Array object (the backing store of lists).
pub mod array {
    /// 4-byte element count.
    pub const COUNT_OFFSET: u64 = 0x18;
    /// First pointer-sized element.
    pub const FIRST_ITEM_OFFSET: u64 = 0x20;
}

/// Growable list object (`List<T>`).
pub mod list {
    /// Pointer to the backing array object.
    pub const BACKING_ARRAY_OFFSET: u64 = 0x10;
}

/// Hash-bucketed dictionary (`Dictionary<K, V>`).
pub mod dict {
    /// Object header length before the bucket/entry fields.
    pub const HEADER_LEN_64: u64 = 16;
    /// 32-bit layout. No current call site exercises this path; it is kept
    /// and unit-tested against synthetic buffers only.
    pub const HEADER_LEN_32: u64 = 8;

    /// Pointer to the bucket array, directly after the header.
    pub const BUCKETS_PTR_LEN: u64 = 8;
    /// Pointer to the entry array, after the bucket pointer.
    pub const ENTRIES_PTR_LEN: u64 = 8;

    /// Entries live in an array object; its elements start here.
    pub const ENTRY_ARRAY_FIRST_ITEM_OFFSET: u64 = 0x20;

    /// One entry record: hash (4) + next index (4) + key (8) + value (8).
    pub const ENTRY_LEN: usize = 24;

    /// Hash value marking a removed/free slot. Still counted, skippable
    /// by consumers.
    pub const REMOVED_ENTRY_HASH: u32 = 0xFFFF_FFFF;
}

/// Immutable string object.
pub mod string {
    /// Object header skipped before the character count.
    pub const HEADER_LEN_64: u64 = 16;
    pub const HEADER_LEN_32: u64 = 8;
    /// 4-byte UTF-16 code-unit count, followed directly by the characters.
    pub const CHAR_COUNT_LEN: u64 = 4;
}

/// XOR-obscured integer cell (the target's anti-memory-editing scheme for
/// stats, reset counters and skill ranges).
pub mod obscured {
    /// 4-byte running key.
    pub const KEY_OFFSET: u64 = 0;
    /// 4-byte encrypted payload; value = key ^ encrypted.
    pub const ENCRYPTED_OFFSET: u64 = 4;
    /// 1-byte presence flag; zero means the cell was never initialized
    /// and decodes to zero.
    pub const PRESENT_FLAG_OFFSET: u64 = 8;
}

/// Upper bound on any declared collection count. A count past this is a
/// misread or a corrupted object, not data.
pub const MAX_COLLECTION_COUNT: u32 = 100_000;
