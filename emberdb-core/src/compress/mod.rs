//! Page compressors for time-series samples
//!
//! A compressor encodes a stream of `(timestamp, f64)` pairs into a byte
//! region bounded by one physical page, and emits a cursor that is
//! sufficient to resume decoding after reopen. Three versions coexist:
//!
//! - **V0**: uncompressed 16-byte samples buffered in memory; the only
//!   encoder valid for out-of-order pages.
//! - **V1**: Gorilla delta-of-delta + XOR, written through to the page.
//! - **V2**: V1 with millisecond-wide delta-of-delta buckets.
//!
//! The version recorded in a file's header — never the process default —
//! selects the decoder when the file is reopened.

mod bits;
mod gorilla;
mod plain;

pub use bits::{BitReader, BitWriter};
pub use gorilla::GorillaCompressor;
pub use plain::PlainCompressor;

use crate::error::{EmberError, Result};
use crate::types::{DataPointVector, Timestamp};

/// Default encoder version for newly created files
pub const DEFAULT_COMPRESSOR_VERSION: u8 = 1;

/// Highest encoder version this build can produce
pub const MAX_COMPRESSOR_VERSION: u8 = 2;

/// Bitstream cursor persisted into the on-disk page header
///
/// For V1+ `offset` counts whole bytes and `start` the bits used in the
/// trailing partial byte; for V0 `offset` counts samples and `start` is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompressorPosition {
    pub offset: u16,
    pub start: u8,
}

/// Encoder/decoder state machine for one page
pub trait Compressor: Send {
    /// Bind to a region of `capacity` bytes with `base` as the relative origin
    fn init(&mut self, base: Timestamp, capacity: usize);

    /// Append a sample; `false` leaves the internal state unchanged, either
    /// because the bitstream would exceed capacity (the page is now full)
    /// or because the timestamp is older than the last one accepted
    fn compress(&mut self, page: &mut [u8], tstamp: Timestamp, value: f64) -> bool;

    fn is_full(&self) -> bool;
    fn is_empty(&self) -> bool;

    /// Current encoded length in bytes (≤ capacity)
    fn size(&self) -> usize;

    /// Snapshot the cursor for the on-disk header
    fn save_position(&self) -> CompressorPosition;

    /// Copy the encoded bitstream into `dest`; encoders that write through
    /// to the page leave `dest` untouched
    fn save_to(&self, dest: &mut [u8]);

    /// Decode from scratch up to `position`, appending into `out`, and adopt
    /// the decoded state so further appends continue the stream
    fn restore(
        &mut self,
        page: &[u8],
        position: CompressorPosition,
        out: &mut DataPointVector,
    ) -> Result<()>;

    /// Decode everything written so far without disturbing encoder state
    fn uncompress(&self, page: &[u8], out: &mut DataPointVector) -> Result<()>;

    /// Timestamp of the most recent sample (the base when empty)
    fn last_timestamp(&self) -> Timestamp;

    /// Samples held by this compressor
    fn dp_count(&self) -> usize;

    fn version(&self) -> u8;
}

/// Instantiate the encoder recorded for a page or file
pub fn create(version: u8) -> Result<Box<dyn Compressor>> {
    match version {
        0 => Ok(Box::new(PlainCompressor::new())),
        1 | 2 => Ok(Box::new(GorillaCompressor::new(version))),
        v => Err(EmberError::CorruptStream(format!(
            "unsupported compressor version {}",
            v
        ))),
    }
}
