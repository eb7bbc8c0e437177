//! Version-0 compressor: uncompressed 16-byte samples in an owned buffer
//!
//! The eager encoder keeps its samples in memory and only touches the page
//! on `save_to`. It accepts timestamps in any order, which is why
//! out-of-order pages are always encoded with it.

use super::{Compressor, CompressorPosition};
use crate::error::{EmberError, Result};
use crate::types::{DataPoint, DataPointVector, Timestamp};
use bytes::{Buf, BufMut};

/// Bytes per stored sample: u64 timestamp + f64 bits, both little-endian
pub const SAMPLE_SIZE: usize = 16;

/// Eager version-0 encoder
pub struct PlainCompressor {
    base: Timestamp,
    capacity: usize,
    dps: DataPointVector,
    full: bool,
}

impl PlainCompressor {
    pub fn new() -> Self {
        Self {
            base: 0,
            capacity: 0,
            dps: Vec::new(),
            full: false,
        }
    }
}

impl Default for PlainCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for PlainCompressor {
    fn init(&mut self, base: Timestamp, capacity: usize) {
        self.base = base;
        self.capacity = capacity;
        self.dps.clear();
        self.full = false;
    }

    fn compress(&mut self, _page: &mut [u8], tstamp: Timestamp, value: f64) -> bool {
        if self.full {
            return false;
        }
        if (self.dps.len() + 1) * SAMPLE_SIZE > self.capacity {
            self.full = true;
            return false;
        }
        self.dps.push(DataPoint::new(tstamp, value));
        true
    }

    fn is_full(&self) -> bool {
        self.full
    }

    fn is_empty(&self) -> bool {
        self.dps.is_empty()
    }

    fn size(&self) -> usize {
        self.dps.len() * SAMPLE_SIZE
    }

    fn save_position(&self) -> CompressorPosition {
        // the cursor counts samples, not bytes
        CompressorPosition {
            offset: self.dps.len() as u16,
            start: 0,
        }
    }

    fn save_to(&self, dest: &mut [u8]) {
        let mut buf = &mut dest[..self.dps.len() * SAMPLE_SIZE];
        for dp in &self.dps {
            buf.put_u64_le(dp.timestamp);
            buf.put_u64_le(dp.value.to_bits());
        }
    }

    fn restore(
        &mut self,
        page: &[u8],
        position: CompressorPosition,
        out: &mut DataPointVector,
    ) -> Result<()> {
        let count = position.offset as usize;
        if count * SAMPLE_SIZE > page.len() {
            return Err(EmberError::CorruptStream(format!(
                "plain stream claims {} samples but page holds {} bytes",
                count,
                page.len()
            )));
        }

        self.dps.clear();
        self.dps.reserve(count);

        let mut buf = &page[..count * SAMPLE_SIZE];
        for _ in 0..count {
            let ts = buf.get_u64_le();
            let bits = buf.get_u64_le();
            self.dps.push(DataPoint::new(ts, f64::from_bits(bits)));
        }

        out.extend_from_slice(&self.dps);
        Ok(())
    }

    fn uncompress(&self, _page: &[u8], out: &mut DataPointVector) -> Result<()> {
        out.extend_from_slice(&self.dps);
        Ok(())
    }

    fn last_timestamp(&self) -> Timestamp {
        self.dps.last().map(|dp| dp.timestamp).unwrap_or(self.base)
    }

    fn dp_count(&self) -> usize {
        self.dps.len()
    }

    fn version(&self) -> u8 {
        0
    }
}
