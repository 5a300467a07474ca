//! Bit-exact segment layout.
//!
//! A segment file is a fixed header, an array of `max_queue_size` descriptor
//! slots, and a data arena filling the rest of the file. All fields are
//! little-endian fixed-width integers at the offsets defined here; the mapping
//! is treated as an opaque byte buffer and every access goes through these
//! offset constants. Counters that coordinate producer and consumers are
//! accessed through aligned atomic views (release on publish, acquire on
//! consume).
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (336 bytes): indices, format, consumer table,     │
//! │ control sub-ring                                         │
//! ├──────────────────────────────────────────────────────────┤
//! │ Descriptor slots: max_queue_size × 168 bytes             │
//! ├──────────────────────────────────────────────────────────┤
//! │ Data arena: remainder of the file                        │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64};

/// Magic bytes at offset 0, `b"M1SH"` as a little-endian u32.
pub const MAGIC: u32 = u32::from_le_bytes(*b"M1SH");

/// Current layout version.
pub const VERSION: u32 = 1;

/// Maximum registered consumers per segment.
pub const MAX_CONSUMERS: usize = 16;

/// Bytes reserved for the segment name in the header.
pub const NAME_LEN: usize = 64;

/// Fixed capacity of the consumer→producer control sub-ring.
pub const CONTROL_CAPACITY: usize = 8;

/// Bytes per control slot: `param_id:u32, tag:u32, value:u64`.
pub const CONTROL_SLOT_SIZE: usize = 16;

/// Minimum total file size.
pub const MIN_SEGMENT_SIZE: usize = 4096;

/// Header field offsets.
pub mod header {
    use super::{CONTROL_CAPACITY, CONTROL_SLOT_SIZE, MAX_CONSUMERS, NAME_LEN};

    pub const MAGIC: usize = 0x00;
    pub const VERSION: usize = 0x04;
    pub const WRITE_INDEX: usize = 0x08; // atomic
    pub const READ_INDEX: usize = 0x0C; // atomic
    pub const QUEUE_SIZE: usize = 0x10; // atomic
    pub const MAX_QUEUE_SIZE: usize = 0x14;
    pub const HAS_DATA: usize = 0x18; // atomic
    pub const BUFFER_SIZE: usize = 0x1C; // arena length
    pub const SAMPLE_RATE: usize = 0x20;
    pub const NUM_CHANNELS: usize = 0x24;
    pub const SAMPLES_PER_BLOCK: usize = 0x28;
    pub const NEXT_SEQUENCE: usize = 0x2C; // atomic
    pub const NEXT_BUFFER_ID: usize = 0x30; // atomic u64
    pub const NAME: usize = 0x38;
    pub const CONSUMER_COUNT: usize = NAME + NAME_LEN; // 0x78, atomic
    pub const CONSUMER_IDS: usize = CONSUMER_COUNT + 4; // 0x7C
    pub const CONTROL_COUNT: usize = CONSUMER_IDS + MAX_CONSUMERS * 4; // 0xBC, atomic
    pub const CONTROL_READ: usize = CONTROL_COUNT + 4; // 0xC0
    pub const CONTROL_WRITE: usize = CONTROL_READ + 4; // 0xC4
    // 8 reserved bytes keep the control slots 16-byte aligned.
    pub const CONTROL_SLOTS: usize = CONTROL_WRITE + 4 + 8; // 0xD0

    pub const SIZE: usize = CONTROL_SLOTS + CONTROL_CAPACITY * CONTROL_SLOT_SIZE; // 336
}

/// Descriptor slot field offsets (relative to the slot base).
pub mod slot {
    use super::MAX_CONSUMERS;

    pub const BUFFER_ID: usize = 0x00; // u64
    pub const TIMESTAMP: usize = 0x08; // u64, ms since epoch
    pub const SEQUENCE: usize = 0x10;
    pub const DATA_SIZE: usize = 0x14;
    pub const DATA_OFFSET: usize = 0x18;
    pub const REQUIRES_ACK: usize = 0x1C;
    pub const CONSUMER_COUNT: usize = 0x20;
    pub const ACKNOWLEDGED_COUNT: usize = 0x24; // atomic
    pub const CONSUMER_IDS: usize = 0x28;
    pub const ACKNOWLEDGED: usize = CONSUMER_IDS + MAX_CONSUMERS * 4; // 0x68, atomic u32 per entry

    pub const SIZE: usize = ACKNOWLEDGED + MAX_CONSUMERS * 4; // 168
}

// Slot bases stay 8-aligned so the u64 fields get natural alignment.
const _: () = assert!(header::SIZE % 8 == 0);
const _: () = assert!(slot::SIZE % 8 == 0);

/// Byte offset of descriptor slot `index`.
pub fn slot_offset(index: u32, max_queue: u32) -> usize {
    debug_assert!(index < max_queue);
    header::SIZE + index as usize * slot::SIZE
}

/// Byte offset where the data arena begins.
pub fn arena_offset(max_queue: u32) -> usize {
    header::SIZE + max_queue as usize * slot::SIZE
}

/// Arena length for a file of `total_size` bytes.
pub fn arena_len(total_size: usize, max_queue: u32) -> usize {
    total_size.saturating_sub(arena_offset(max_queue))
}

/// Align an arena offset up to 4 bytes so f32 audio lands naturally aligned.
pub fn align_arena(offset: usize) -> usize {
    (offset + 3) & !3
}

/// Plain little-endian u32 read.
///
/// # Safety
/// `base + offset + 4` must be inside the mapping.
pub unsafe fn get_u32(base: *const u8, offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    std::ptr::copy_nonoverlapping(base.add(offset), raw.as_mut_ptr(), 4);
    u32::from_le_bytes(raw)
}

/// Plain little-endian u32 write.
///
/// # Safety
/// `base + offset + 4` must be inside the mapping.
pub unsafe fn put_u32(base: *mut u8, offset: usize, value: u32) {
    let raw = value.to_le_bytes();
    std::ptr::copy_nonoverlapping(raw.as_ptr(), base.add(offset), 4);
}

/// Plain little-endian u64 read.
///
/// # Safety
/// `base + offset + 8` must be inside the mapping.
pub unsafe fn get_u64(base: *const u8, offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    std::ptr::copy_nonoverlapping(base.add(offset), raw.as_mut_ptr(), 8);
    u64::from_le_bytes(raw)
}

/// Plain little-endian u64 write.
///
/// # Safety
/// `base + offset + 8` must be inside the mapping.
pub unsafe fn put_u64(base: *mut u8, offset: usize, value: u64) {
    let raw = value.to_le_bytes();
    std::ptr::copy_nonoverlapping(raw.as_ptr(), base.add(offset), 8);
}

/// Atomic view of a u32 counter inside the mapping.
///
/// # Safety
/// `base + offset` must be inside the mapping and 4-aligned; the location must
/// only ever be accessed atomically while shared.
pub unsafe fn atomic_u32(base: *const u8, offset: usize) -> &'static AtomicU32 {
    debug_assert!(offset % 4 == 0);
    &*(base.add(offset) as *const AtomicU32)
}

/// Atomic view of a u64 counter inside the mapping.
///
/// # Safety
/// `base + offset` must be inside the mapping and 8-aligned; the location must
/// only ever be accessed atomically while shared.
pub unsafe fn atomic_u64(base: *const u8, offset: usize) -> &'static AtomicU64 {
    debug_assert!(offset % 8 == 0);
    &*(base.add(offset) as *const AtomicU64)
}
