//! File-backed shared-memory segment with an acknowledged buffer queue.
//!
//! One producer writes audio blocks plus a parameter map into its own segment;
//! up to [`MAX_CONSUMERS`] readers attach, register a consumer ID, and drain
//! buffers in sequence order. Buffers marked `requires_ack` survive until every
//! registered consumer has acknowledged them; everything else is dropped
//! oldest-first under back-pressure.
//!
//! Uses an `UnsafeCell<MmapMut>` so the mapping can be written through a shared
//! reference. This is sound because:
//! 1. structural queue mutations happen only on the producer side, under the
//!    producer's queue lock;
//! 2. consumers only flip their own acknowledgment bits, which are atomic;
//! 3. the indices that publish descriptors use release/acquire ordering.

use crate::error::{MemShareError, Result};
use crate::layout::{
    self, align_arena, arena_len, arena_offset, header, slot, slot_offset, CONTROL_CAPACITY,
    CONTROL_SLOT_SIZE, MAGIC, MAX_CONSUMERS, MIN_SEGMENT_SIZE, NAME_LEN, VERSION,
};
use crate::params::ParameterMap;
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Grace window after which an unacknowledged buffer without `requires_ack`
/// may be reclaimed by the producer.
pub const CLEANUP_GRACE_MS: u64 = 1000;

/// Bytes of per-buffer metadata written ahead of the channel samples.
const PAYLOAD_PRELUDE: usize = 32;

mod prelude_field {
    pub const NUM_CHANNELS: usize = 0x00;
    pub const NUM_SAMPLES: usize = 0x04;
    pub const DAW_TIMESTAMP: usize = 0x08;
    pub const PLAYHEAD: usize = 0x10;
    pub const FLAGS: usize = 0x18;
    pub const UPDATE_SOURCE: usize = 0x1C;
}

/// Where a parameter update originated. Consumers use this to break update
/// cycles between host automation, UI edits, and shared-memory echoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Host,
    Ui,
    MemShare,
}

impl UpdateSource {
    fn as_u32(self) -> u32 {
        match self {
            UpdateSource::Host => 0,
            UpdateSource::Ui => 1,
            UpdateSource::MemShare => 2,
        }
    }

    fn from_u32(raw: u32) -> Self {
        match raw {
            1 => UpdateSource::Ui,
            2 => UpdateSource::MemShare,
            _ => UpdateSource::Host,
        }
    }
}

/// Audio format advertised in the segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub num_channels: u32,
    pub samples_per_block: u32,
}

/// Options for [`Segment::write_buffer`].
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub requires_ack: bool,
    pub daw_timestamp: u64,
    pub playhead_seconds: f64,
    pub is_playing: bool,
    pub update_source: UpdateSource,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            requires_ack: false,
            daw_timestamp: 0,
            playhead_seconds: 0.0,
            is_playing: false,
            update_source: UpdateSource::Host,
        }
    }
}

/// One buffer copied out of a segment.
#[derive(Debug, Clone)]
pub struct BufferRead {
    pub buffer_id: u64,
    pub sequence: u32,
    pub timestamp_ms: u64,
    pub audio: Vec<Vec<f32>>,
    pub params: ParameterMap,
    pub daw_timestamp: u64,
    pub playhead_seconds: f64,
    pub is_playing: bool,
    pub update_source: UpdateSource,
}

/// Reserved consumer→producer parameter write (control sub-ring).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlMessage {
    pub param_id: u32,
    pub value: ControlValue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlValue {
    F32(f32),
    I32(i32),
    Bool(bool),
}

/// Usage counters for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentStats {
    pub total_size: usize,
    pub arena_size: usize,
    pub queued_buffers: u32,
    pub acknowledged_buffers: u32,
    pub consumer_count: u32,
}

/// A mapped segment, either created (producer) or attached (consumer).
pub struct Segment {
    mmap: UnsafeCell<MmapMut>,
    path: PathBuf,
    total_size: usize,
    max_queue: u32,
    owns_file: bool,
    queue_lock: Mutex<()>,
}

// SAFETY: see the module docs. Structural mutation is producer-only under
// `queue_lock`, consumers touch only their own atomic ack bits, and the
// publishing indices use release/acquire ordering.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a fresh segment file, zeroing the header and formatting the
    /// arena. The creator owns the file and removes it on drop.
    pub fn create(path: &Path, name: &str, total_size: usize, max_queue: u32) -> Result<Self> {
        if max_queue == 0 {
            return Err(MemShareError::Corrupt("max_queue must be non-zero".into()));
        }
        let needed = arena_offset(max_queue) + 4;
        if total_size < MIN_SEGMENT_SIZE.max(needed) {
            return Err(MemShareError::Corrupt(format!(
                "segment size {total_size} below minimum {}",
                MIN_SEGMENT_SIZE.max(needed)
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_size as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file) }?;

        let segment = Self {
            mmap: UnsafeCell::new(mmap),
            path: path.to_path_buf(),
            total_size,
            max_queue,
            owns_file: true,
            queue_lock: Mutex::new(()),
        };

        unsafe {
            let base = segment.base();
            std::ptr::write_bytes(base, 0, header::SIZE);
            layout::put_u32(base, header::MAGIC, MAGIC);
            layout::put_u32(base, header::VERSION, VERSION);
            layout::put_u32(base, header::MAX_QUEUE_SIZE, max_queue);
            layout::put_u32(
                base,
                header::BUFFER_SIZE,
                arena_len(total_size, max_queue) as u32,
            );
            layout::put_u64(base, header::NEXT_BUFFER_ID, 1);
            layout::put_u32(base, header::NEXT_SEQUENCE, 1);

            let bytes = name.as_bytes();
            let len = bytes.len().min(NAME_LEN - 1);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(header::NAME), len);
        }

        tracing::debug!(name, total_size, max_queue, "created segment");
        Ok(segment)
    }

    /// Attach to an existing segment. Validates magic, version, arena bounds,
    /// and the expected queue capacity; a failed attach leaves the file
    /// untouched.
    pub fn attach(path: &Path, expected_max_queue: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let total_size = file.metadata()?.len() as usize;
        if total_size < MIN_SEGMENT_SIZE {
            return Err(MemShareError::Corrupt(format!(
                "file is {total_size} bytes, below the {MIN_SEGMENT_SIZE}-byte minimum"
            )));
        }
        let mmap = unsafe { MmapMut::map_mut(&file) }?;

        let base = mmap.as_ptr();
        let (magic, version, max_queue, buffer_size) = unsafe {
            (
                layout::get_u32(base, header::MAGIC),
                layout::get_u32(base, header::VERSION),
                layout::get_u32(base, header::MAX_QUEUE_SIZE),
                layout::get_u32(base, header::BUFFER_SIZE),
            )
        };

        if magic != MAGIC {
            return Err(MemShareError::Corrupt(format!("bad magic {magic:#010x}")));
        }
        if version != VERSION {
            return Err(MemShareError::Corrupt(format!(
                "layout version {version}, expected {VERSION}"
            )));
        }
        if max_queue != expected_max_queue {
            return Err(MemShareError::Corrupt(format!(
                "queue capacity {max_queue}, expected {expected_max_queue}"
            )));
        }
        if arena_offset(max_queue) >= total_size
            || buffer_size as usize != arena_len(total_size, max_queue)
        {
            return Err(MemShareError::Corrupt(format!(
                "arena of {buffer_size} bytes does not match a {total_size}-byte file"
            )));
        }

        Ok(Self {
            mmap: UnsafeCell::new(mmap),
            path: path.to_path_buf(),
            total_size,
            max_queue,
            owns_file: false,
            queue_lock: Mutex::new(()),
        })
    }

    fn base(&self) -> *mut u8 {
        unsafe { (*self.mmap.get()).as_mut_ptr() }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn arena_size(&self) -> usize {
        arena_len(self.total_size, self.max_queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_queue(&self) -> u32 {
        self.max_queue
    }

    pub fn name(&self) -> String {
        let base = self.base();
        let mut raw = [0u8; NAME_LEN];
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(header::NAME), raw.as_mut_ptr(), NAME_LEN);
        }
        let end = raw.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    /// Install the audio format into the header.
    pub fn init_audio_format(&self, format: AudioFormat) {
        let base = self.base();
        unsafe {
            layout::put_u32(base, header::SAMPLE_RATE, format.sample_rate);
            layout::put_u32(base, header::NUM_CHANNELS, format.num_channels);
            layout::put_u32(base, header::SAMPLES_PER_BLOCK, format.samples_per_block);
        }
    }

    pub fn audio_format(&self) -> AudioFormat {
        let base = self.base();
        unsafe {
            AudioFormat {
                sample_rate: layout::get_u32(base, header::SAMPLE_RATE),
                num_channels: layout::get_u32(base, header::NUM_CHANNELS),
                samples_per_block: layout::get_u32(base, header::SAMPLES_PER_BLOCK),
            }
        }
    }

    // ------------------------------------------------------------------
    // Consumer table
    // ------------------------------------------------------------------

    fn consumer_slot(&self, consumer_id: u32) -> Option<usize> {
        let base = self.base();
        let count = unsafe { layout::atomic_u32(base, header::CONSUMER_COUNT) }
            .load(Ordering::Acquire) as usize;
        (0..count.min(MAX_CONSUMERS)).find(|i| {
            (unsafe { layout::get_u32(base, header::CONSUMER_IDS + i * 4) }) == consumer_id
        })
    }

    /// Register a reader. ID 0 is reserved; re-registering is an Ok no-op.
    /// Registration is published before returning, so the producer's next
    /// write seeds this consumer.
    pub fn register_consumer(&self, consumer_id: u32) -> Result<()> {
        if consumer_id == 0 {
            return Err(MemShareError::Corrupt("consumer id 0 is reserved".into()));
        }
        let _guard = self.queue_lock.lock();
        if self.consumer_slot(consumer_id).is_some() {
            return Ok(());
        }
        let base = self.base();
        let count_atomic = unsafe { layout::atomic_u32(base, header::CONSUMER_COUNT) };
        let count = count_atomic.load(Ordering::Acquire) as usize;
        if count >= MAX_CONSUMERS {
            return Err(MemShareError::ConsumerTableFull { max: MAX_CONSUMERS });
        }
        unsafe {
            layout::put_u32(base, header::CONSUMER_IDS + count * 4, consumer_id);
        }
        count_atomic.store(count as u32 + 1, Ordering::Release);
        tracing::debug!(consumer_id, "registered consumer");
        Ok(())
    }

    /// Drop a reader from the consumer table. Descriptors already seeded with
    /// this consumer keep their snapshot.
    pub fn unregister_consumer(&self, consumer_id: u32) -> Result<()> {
        let _guard = self.queue_lock.lock();
        let pos = self
            .consumer_slot(consumer_id)
            .ok_or(MemShareError::ConsumerNotRegistered(consumer_id))?;
        let base = self.base();
        let count_atomic = unsafe { layout::atomic_u32(base, header::CONSUMER_COUNT) };
        let count = count_atomic.load(Ordering::Acquire) as usize;
        unsafe {
            let last = layout::get_u32(base, header::CONSUMER_IDS + (count - 1) * 4);
            layout::put_u32(base, header::CONSUMER_IDS + pos * 4, last);
            layout::put_u32(base, header::CONSUMER_IDS + (count - 1) * 4, 0);
        }
        count_atomic.store(count as u32 - 1, Ordering::Release);
        Ok(())
    }

    pub fn consumer_count(&self) -> u32 {
        unsafe { layout::atomic_u32(self.base(), header::CONSUMER_COUNT) }.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Producer side
    // ------------------------------------------------------------------

    /// Write one audio block plus its parameter map.
    ///
    /// All channels must have equal length. Returns the assigned buffer ID.
    /// A full queue whose oldest descriptor still awaits required
    /// acknowledgments fails with [`MemShareError::QueueFull`] and leaves the
    /// segment unchanged.
    pub fn write_buffer(
        &self,
        audio: &[Vec<f32>],
        params: &ParameterMap,
        opts: &WriteOptions,
    ) -> Result<u64> {
        let num_channels = audio.len();
        let num_samples = audio.first().map(Vec::len).unwrap_or(0);
        assert!(
            audio.iter().all(|ch| ch.len() == num_samples),
            "all channels must have equal length"
        );

        let params_len = params.encoded_len();
        let payload_len = PAYLOAD_PRELUDE + num_channels * num_samples * 4 + params_len;
        let arena = self.arena_size();
        if payload_len > arena {
            return Err(MemShareError::ArenaOverflow {
                requested: payload_len,
                arena,
            });
        }

        let _guard = self.queue_lock.lock();
        let base = self.base();
        let write_atomic = unsafe { layout::atomic_u32(base, header::WRITE_INDEX) };
        let queue_atomic = unsafe { layout::atomic_u32(base, header::QUEUE_SIZE) };

        // Reclaim whatever the head allows before judging back-pressure.
        self.compact_head_locked();

        if queue_atomic.load(Ordering::Acquire) == self.max_queue {
            if self.oldest_blocks_eviction() {
                return Err(MemShareError::QueueFull);
            }
            self.reclaim_oldest_locked();
        }

        // Ring-allocate a region after the newest payload, wrapping to the
        // arena start when the tail has no room.
        let mut data_offset = self.next_arena_offset();
        if data_offset + payload_len > arena {
            data_offset = 0;
        }
        while self.overlaps_live(data_offset, payload_len) {
            if self.oldest_blocks_eviction() {
                return Err(MemShareError::QueueFull);
            }
            if queue_atomic.load(Ordering::Acquire) == 0 {
                return Err(MemShareError::ArenaOverflow {
                    requested: payload_len,
                    arena,
                });
            }
            self.reclaim_oldest_locked();
        }

        // Payload first, descriptor second, indices last.
        let arena_base = arena_offset(self.max_queue);
        unsafe {
            let payload = base.add(arena_base + data_offset);
            layout::put_u32(payload, prelude_field::NUM_CHANNELS, num_channels as u32);
            layout::put_u32(payload, prelude_field::NUM_SAMPLES, num_samples as u32);
            layout::put_u64(payload, prelude_field::DAW_TIMESTAMP, opts.daw_timestamp);
            layout::put_u64(
                payload,
                prelude_field::PLAYHEAD,
                opts.playhead_seconds.to_bits(),
            );
            layout::put_u32(payload, prelude_field::FLAGS, u32::from(opts.is_playing));
            layout::put_u32(
                payload,
                prelude_field::UPDATE_SOURCE,
                opts.update_source.as_u32(),
            );

            let mut cursor = PAYLOAD_PRELUDE;
            for channel in audio {
                let bytes = channel.len() * 4;
                std::ptr::copy_nonoverlapping(
                    channel.as_ptr() as *const u8,
                    payload.add(cursor),
                    bytes,
                );
                cursor += bytes;
            }

            let mut encoded = Vec::with_capacity(params_len);
            params.encode(&mut encoded);
            std::ptr::copy_nonoverlapping(encoded.as_ptr(), payload.add(cursor), encoded.len());
        }

        let buffer_id = unsafe { layout::atomic_u64(base, header::NEXT_BUFFER_ID) }
            .fetch_add(1, Ordering::AcqRel);
        let sequence = unsafe { layout::atomic_u32(base, header::NEXT_SEQUENCE) }
            .fetch_add(1, Ordering::AcqRel);
        let timestamp = Self::now_ms();

        let write_index = write_atomic.load(Ordering::Acquire);
        let s = slot_offset(write_index % self.max_queue, self.max_queue);
        unsafe {
            layout::put_u64(base, s + slot::BUFFER_ID, buffer_id);
            layout::put_u64(base, s + slot::TIMESTAMP, timestamp);
            layout::put_u32(base, s + slot::SEQUENCE, sequence);
            layout::put_u32(base, s + slot::DATA_SIZE, payload_len as u32);
            layout::put_u32(base, s + slot::DATA_OFFSET, data_offset as u32);
            layout::put_u32(base, s + slot::REQUIRES_ACK, u32::from(opts.requires_ack));

            // Seed the acknowledgment table from the current consumer list.
            let consumers =
                layout::atomic_u32(base, header::CONSUMER_COUNT).load(Ordering::Acquire);
            layout::put_u32(base, s + slot::CONSUMER_COUNT, consumers);
            for i in 0..MAX_CONSUMERS {
                let id = if (i as u32) < consumers {
                    layout::get_u32(base, header::CONSUMER_IDS + i * 4)
                } else {
                    0
                };
                layout::put_u32(base, s + slot::CONSUMER_IDS + i * 4, id);
                layout::atomic_u32(base, s + slot::ACKNOWLEDGED + i * 4)
                    .store(0, Ordering::Relaxed);
            }
            layout::atomic_u32(base, s + slot::ACKNOWLEDGED_COUNT).store(0, Ordering::Relaxed);
        }

        // Publish: descriptor contents must be visible before the index moves.
        write_atomic.store(write_index.wrapping_add(1), Ordering::Release);
        queue_atomic.fetch_add(1, Ordering::Release);
        unsafe { layout::atomic_u32(base, header::HAS_DATA) }.store(1, Ordering::Release);

        Ok(buffer_id)
    }

    /// Producer-side queue compaction: reclaims fully-acknowledged head
    /// descriptors, corrupt descriptors, and unacknowledged non-ack buffers
    /// older than the grace window. Returns the number reclaimed.
    pub fn cleanup(&self) -> u32 {
        let _guard = self.queue_lock.lock();
        self.compact_head_locked()
    }

    fn compact_head_locked(&self) -> u32 {
        let base = self.base();
        let queue_atomic = unsafe { layout::atomic_u32(base, header::QUEUE_SIZE) };
        let read_atomic = unsafe { layout::atomic_u32(base, header::READ_INDEX) };
        let now = Self::now_ms();
        let mut reclaimed = 0;

        while queue_atomic.load(Ordering::Acquire) > 0 {
            let s = slot_offset(
                read_atomic.load(Ordering::Acquire) % self.max_queue,
                self.max_queue,
            );
            let (requires_ack, consumers, timestamp) = unsafe {
                (
                    layout::get_u32(base, s + slot::REQUIRES_ACK) != 0,
                    layout::get_u32(base, s + slot::CONSUMER_COUNT),
                    layout::get_u64(base, s + slot::TIMESTAMP),
                )
            };
            let acked = unsafe { layout::atomic_u32(base, s + slot::ACKNOWLEDGED_COUNT) }
                .load(Ordering::Acquire);

            let corrupt = !self.descriptor_in_bounds(s);
            let fully_acked = consumers > 0 && acked >= consumers;
            let expired = !requires_ack && now.saturating_sub(timestamp) > CLEANUP_GRACE_MS;

            if corrupt || fully_acked || expired {
                if corrupt {
                    tracing::warn!("reclaiming corrupt descriptor at queue head");
                }
                self.reclaim_oldest_locked();
                reclaimed += 1;
            } else {
                break;
            }
        }
        reclaimed
    }

    /// True when evicting the oldest descriptor would drop a buffer that still
    /// awaits required acknowledgments.
    fn oldest_blocks_eviction(&self) -> bool {
        let base = self.base();
        if unsafe { layout::atomic_u32(base, header::QUEUE_SIZE) }.load(Ordering::Acquire) == 0 {
            return false;
        }
        let read_index =
            unsafe { layout::atomic_u32(base, header::READ_INDEX) }.load(Ordering::Acquire);
        let s = slot_offset(read_index % self.max_queue, self.max_queue);
        let requires_ack = unsafe { layout::get_u32(base, s + slot::REQUIRES_ACK) } != 0;
        if !requires_ack {
            return false;
        }
        let consumers = unsafe { layout::get_u32(base, s + slot::CONSUMER_COUNT) };
        let acked =
            unsafe { layout::atomic_u32(base, s + slot::ACKNOWLEDGED_COUNT) }.load(Ordering::Acquire);
        acked < consumers
    }

    fn reclaim_oldest_locked(&self) {
        let base = self.base();
        let queue_atomic = unsafe { layout::atomic_u32(base, header::QUEUE_SIZE) };
        let read_atomic = unsafe { layout::atomic_u32(base, header::READ_INDEX) };
        let read_index = read_atomic.load(Ordering::Acquire);
        read_atomic.store(read_index.wrapping_add(1), Ordering::Release);
        if queue_atomic.fetch_sub(1, Ordering::AcqRel) == 1 {
            unsafe { layout::atomic_u32(base, header::HAS_DATA) }.store(0, Ordering::Release);
        }
    }

    /// Arena offset just past the newest payload, 4-aligned.
    fn next_arena_offset(&self) -> usize {
        let base = self.base();
        if unsafe { layout::atomic_u32(base, header::QUEUE_SIZE) }.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let write_index =
            unsafe { layout::atomic_u32(base, header::WRITE_INDEX) }.load(Ordering::Acquire);
        let s = slot_offset(write_index.wrapping_sub(1) % self.max_queue, self.max_queue);
        let (off, size) = unsafe {
            (
                layout::get_u32(base, s + slot::DATA_OFFSET) as usize,
                layout::get_u32(base, s + slot::DATA_SIZE) as usize,
            )
        };
        align_arena(off + size)
    }

    /// Does `[offset, offset + len)` intersect any live payload region?
    fn overlaps_live(&self, offset: usize, len: usize) -> bool {
        let base = self.base();
        let queue = unsafe { layout::atomic_u32(base, header::QUEUE_SIZE) }.load(Ordering::Acquire);
        let read_index =
            unsafe { layout::atomic_u32(base, header::READ_INDEX) }.load(Ordering::Acquire);
        for i in 0..queue {
            let s = slot_offset(read_index.wrapping_add(i) % self.max_queue, self.max_queue);
            let (d_off, d_size) = unsafe {
                (
                    layout::get_u32(base, s + slot::DATA_OFFSET) as usize,
                    layout::get_u32(base, s + slot::DATA_SIZE) as usize,
                )
            };
            if offset < align_arena(d_off + d_size) && d_off < offset + len {
                return true;
            }
        }
        false
    }

    fn descriptor_in_bounds(&self, slot_off: usize) -> bool {
        let base = self.base();
        let (d_off, d_size) = unsafe {
            (
                layout::get_u32(base, slot_off + slot::DATA_OFFSET) as usize,
                layout::get_u32(base, slot_off + slot::DATA_SIZE) as usize,
            )
        };
        d_size >= PAYLOAD_PRELUDE && d_off + d_size <= self.arena_size()
    }

    // ------------------------------------------------------------------
    // Consumer side
    // ------------------------------------------------------------------

    /// Read the oldest buffer this consumer has not yet acknowledged. Scans in
    /// sequence order; descriptors the consumer was not seeded into (written
    /// before it registered) count as already acknowledged. Does not ack.
    pub fn read_oldest_unacked(&self, consumer_id: u32) -> Result<BufferRead> {
        self.consumer_slot(consumer_id)
            .ok_or(MemShareError::ConsumerNotRegistered(consumer_id))?;

        let base = self.base();
        if unsafe { layout::atomic_u32(base, header::HAS_DATA) }.load(Ordering::Acquire) == 0 {
            return Err(MemShareError::NoData);
        }
        let read_index =
            unsafe { layout::atomic_u32(base, header::READ_INDEX) }.load(Ordering::Acquire);
        let queue = unsafe { layout::atomic_u32(base, header::QUEUE_SIZE) }.load(Ordering::Acquire);

        for i in 0..queue {
            let s = slot_offset(read_index.wrapping_add(i) % self.max_queue, self.max_queue);
            if !self.descriptor_in_bounds(s) {
                // Corrupt: skipped here, reclaimed by the producer's cleanup.
                continue;
            }
            let Some(pos) = self.slot_consumer_pos(s, consumer_id) else {
                continue;
            };
            let acked = unsafe { layout::atomic_u32(base, s + slot::ACKNOWLEDGED + pos * 4) }
                .load(Ordering::Acquire);
            if acked == 0 {
                return self.copy_out(s);
            }
        }
        Err(MemShareError::NoData)
    }

    /// Deterministic lookup by buffer ID; same copy semantics as
    /// [`Segment::read_oldest_unacked`].
    pub fn read_by_id(&self, buffer_id: u64) -> Result<BufferRead> {
        let base = self.base();
        let read_index =
            unsafe { layout::atomic_u32(base, header::READ_INDEX) }.load(Ordering::Acquire);
        let queue = unsafe { layout::atomic_u32(base, header::QUEUE_SIZE) }.load(Ordering::Acquire);
        for i in 0..queue {
            let s = slot_offset(read_index.wrapping_add(i) % self.max_queue, self.max_queue);
            if unsafe { layout::get_u64(base, s + slot::BUFFER_ID) } == buffer_id {
                if !self.descriptor_in_bounds(s) {
                    return Err(MemShareError::Corrupt(format!(
                        "buffer {buffer_id} has out-of-bounds payload"
                    )));
                }
                return self.copy_out(s);
            }
        }
        Err(MemShareError::NoData)
    }

    /// Mark `buffer_id` consumed by `consumer_id`. Idempotent.
    pub fn acknowledge(&self, buffer_id: u64, consumer_id: u32) -> Result<()> {
        let base = self.base();
        let read_index =
            unsafe { layout::atomic_u32(base, header::READ_INDEX) }.load(Ordering::Acquire);
        let queue = unsafe { layout::atomic_u32(base, header::QUEUE_SIZE) }.load(Ordering::Acquire);
        for i in 0..queue {
            let s = slot_offset(read_index.wrapping_add(i) % self.max_queue, self.max_queue);
            if unsafe { layout::get_u64(base, s + slot::BUFFER_ID) } != buffer_id {
                continue;
            }
            let Some(pos) = self.slot_consumer_pos(s, consumer_id) else {
                // Registered after this buffer was written; nothing to ack.
                return Ok(());
            };
            let bit = unsafe { layout::atomic_u32(base, s + slot::ACKNOWLEDGED + pos * 4) };
            if bit
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                unsafe { layout::atomic_u32(base, s + slot::ACKNOWLEDGED_COUNT) }
                    .fetch_add(1, Ordering::AcqRel);
            }
            return Ok(());
        }
        Err(MemShareError::NoData)
    }

    fn slot_consumer_pos(&self, slot_off: usize, consumer_id: u32) -> Option<usize> {
        let base = self.base();
        let count =
            unsafe { layout::get_u32(base, slot_off + slot::CONSUMER_COUNT) } as usize;
        (0..count.min(MAX_CONSUMERS)).find(|i| {
            (unsafe { layout::get_u32(base, slot_off + slot::CONSUMER_IDS + i * 4) }) == consumer_id
        })
    }

    fn copy_out(&self, slot_off: usize) -> Result<BufferRead> {
        let base = self.base();
        let (buffer_id, timestamp, sequence, data_size, data_offset) = unsafe {
            (
                layout::get_u64(base, slot_off + slot::BUFFER_ID),
                layout::get_u64(base, slot_off + slot::TIMESTAMP),
                layout::get_u32(base, slot_off + slot::SEQUENCE),
                layout::get_u32(base, slot_off + slot::DATA_SIZE) as usize,
                layout::get_u32(base, slot_off + slot::DATA_OFFSET) as usize,
            )
        };

        let payload = unsafe { base.add(arena_offset(self.max_queue) + data_offset) };
        let (num_channels, num_samples, daw_timestamp, playhead_bits, flags, source) = unsafe {
            (
                layout::get_u32(payload, prelude_field::NUM_CHANNELS) as usize,
                layout::get_u32(payload, prelude_field::NUM_SAMPLES) as usize,
                layout::get_u64(payload, prelude_field::DAW_TIMESTAMP),
                layout::get_u64(payload, prelude_field::PLAYHEAD),
                layout::get_u32(payload, prelude_field::FLAGS),
                layout::get_u32(payload, prelude_field::UPDATE_SOURCE),
            )
        };

        let audio_bytes = num_channels
            .checked_mul(num_samples)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| MemShareError::Corrupt("payload prelude overflow".into()))?;
        let params_len = data_size
            .checked_sub(PAYLOAD_PRELUDE + audio_bytes)
            .ok_or_else(|| MemShareError::Corrupt("payload shorter than its prelude".into()))?;

        let mut audio = Vec::with_capacity(num_channels);
        let mut cursor = PAYLOAD_PRELUDE;
        for _ in 0..num_channels {
            let mut channel = vec![0.0f32; num_samples];
            unsafe {
                std::ptr::copy_nonoverlapping(
                    payload.add(cursor),
                    channel.as_mut_ptr() as *mut u8,
                    num_samples * 4,
                );
            }
            cursor += num_samples * 4;
            audio.push(channel);
        }

        let mut encoded = vec![0u8; params_len];
        unsafe {
            std::ptr::copy_nonoverlapping(payload.add(cursor), encoded.as_mut_ptr(), params_len);
        }
        let params = ParameterMap::decode(&encoded)?;

        Ok(BufferRead {
            buffer_id,
            sequence,
            timestamp_ms: timestamp,
            audio,
            params,
            daw_timestamp,
            playhead_seconds: f64::from_bits(playhead_bits),
            is_playing: flags & 1 != 0,
            update_source: UpdateSource::from_u32(source),
        })
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Number of descriptors currently queued.
    pub fn unconsumed_buffer_count(&self) -> u32 {
        unsafe { layout::atomic_u32(self.base(), header::QUEUE_SIZE) }.load(Ordering::Acquire)
    }

    /// IDs of every queued buffer, oldest first.
    pub fn available_buffer_ids(&self) -> Vec<u64> {
        let base = self.base();
        let read_index =
            unsafe { layout::atomic_u32(base, header::READ_INDEX) }.load(Ordering::Acquire);
        let queue = unsafe { layout::atomic_u32(base, header::QUEUE_SIZE) }.load(Ordering::Acquire);
        (0..queue)
            .map(|i| {
                let s = slot_offset(read_index.wrapping_add(i) % self.max_queue, self.max_queue);
                unsafe { layout::get_u64(base, s + slot::BUFFER_ID) }
            })
            .collect()
    }

    pub fn stats(&self) -> SegmentStats {
        let base = self.base();
        let read_index =
            unsafe { layout::atomic_u32(base, header::READ_INDEX) }.load(Ordering::Acquire);
        let queue = unsafe { layout::atomic_u32(base, header::QUEUE_SIZE) }.load(Ordering::Acquire);
        let mut acknowledged = 0;
        for i in 0..queue {
            let s = slot_offset(read_index.wrapping_add(i) % self.max_queue, self.max_queue);
            let consumers = unsafe { layout::get_u32(base, s + slot::CONSUMER_COUNT) };
            let acked = unsafe { layout::atomic_u32(base, s + slot::ACKNOWLEDGED_COUNT) }
                .load(Ordering::Acquire);
            if consumers > 0 && acked >= consumers {
                acknowledged += 1;
            }
        }
        SegmentStats {
            total_size: self.total_size,
            arena_size: self.arena_size(),
            queued_buffers: queue,
            acknowledged_buffers: acknowledged,
            consumer_count: self.consumer_count(),
        }
    }

    // ------------------------------------------------------------------
    // Control sub-ring (reserved consumer→producer parameter writes)
    // ------------------------------------------------------------------

    /// Queue a parameter write back to the producer.
    pub fn push_control(&self, msg: ControlMessage) -> Result<()> {
        let base = self.base();
        let count = unsafe { layout::atomic_u32(base, header::CONTROL_COUNT) };
        if count.load(Ordering::Acquire) as usize >= CONTROL_CAPACITY {
            return Err(MemShareError::QueueFull);
        }
        let write = unsafe { layout::atomic_u32(base, header::CONTROL_WRITE) };
        let index = write.fetch_add(1, Ordering::AcqRel) as usize % CONTROL_CAPACITY;
        let off = header::CONTROL_SLOTS + index * CONTROL_SLOT_SIZE;
        let (tag, bits) = match msg.value {
            ControlValue::F32(v) => (1, u64::from(v.to_bits())),
            ControlValue::I32(v) => (2, v as u32 as u64),
            ControlValue::Bool(v) => (3, u64::from(v)),
        };
        unsafe {
            layout::put_u32(base, off, msg.param_id);
            layout::put_u32(base, off + 4, tag);
            layout::put_u64(base, off + 8, bits);
        }
        count.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Drain one pending control message (producer side).
    pub fn pop_control(&self) -> Option<ControlMessage> {
        let base = self.base();
        let count = unsafe { layout::atomic_u32(base, header::CONTROL_COUNT) };
        if count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let read = unsafe { layout::atomic_u32(base, header::CONTROL_READ) };
        let index = read.fetch_add(1, Ordering::AcqRel) as usize % CONTROL_CAPACITY;
        let off = header::CONTROL_SLOTS + index * CONTROL_SLOT_SIZE;
        let (param_id, tag, bits) = unsafe {
            (
                layout::get_u32(base, off),
                layout::get_u32(base, off + 4),
                layout::get_u64(base, off + 8),
            )
        };
        count.fetch_sub(1, Ordering::Release);
        let value = match tag {
            1 => ControlValue::F32(f32::from_bits(bits as u32)),
            3 => ControlValue::Bool(bits != 0),
            _ => ControlValue::I32(bits as u32 as i32),
        };
        Some(ControlMessage { param_id, value })
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // Only the creator removes the backing file; readers leave it for the
        // producer (or the scanner's stale-file reclamation).
        if self.owns_file {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
