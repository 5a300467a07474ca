//! Shared-memory exchange for spatial panner audio and parameters.
//!
//! Each panner process creates a file-backed segment and streams audio blocks
//! plus a typed parameter map through a queued, acknowledgment-based protocol;
//! the coordination service discovers those segments on disk and attaches as a
//! consumer.
//!
//! # Example
//!
//! ```no_run
//! use m1_memshare::{AudioFormat, ParameterMap, Segment, WriteOptions, params::ids};
//! # fn main() -> m1_memshare::Result<()> {
//! let segment = Segment::create("/tmp/demo.mem".as_ref(), "demo", 1024 * 1024, 8)?;
//! segment.init_audio_format(AudioFormat {
//!     sample_rate: 48000,
//!     num_channels: 2,
//!     samples_per_block: 512,
//! });
//!
//! let mut params = ParameterMap::new();
//! params.set_f32(ids::AZIMUTH, 0.5);
//! let audio = vec![vec![0.0f32; 512]; 2];
//! segment.write_buffer(&audio, &params, &WriteOptions::default())?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub use error::{MemShareError, Result};

pub mod layout;
pub use layout::{MAX_CONSUMERS, MIN_SEGMENT_SIZE};

pub mod params;
pub use params::{ParameterMap, ParameterValue};

mod name;
pub use name::{SegmentName, SEGMENT_EXTENSION, SEGMENT_PREFIX};

mod segment;
pub use segment::{
    AudioFormat, BufferRead, ControlMessage, ControlValue, Segment, SegmentStats, UpdateSource,
    WriteOptions, CLEANUP_GRACE_MS,
};
