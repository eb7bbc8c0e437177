//! Gorilla compressor: delta-of-delta timestamps, XOR-encoded values
//!
//! Implements the bit layout from Facebook's paper "Gorilla: A Fast,
//! Scalable, In-Memory Time Series Database", writing directly into the
//! mapped page bytes. Version 2 differs only in its delta-of-delta bucket
//! table, widened for millisecond timestamps.

use super::bits::{BitReader, BitWriter};
use super::{Compressor, CompressorPosition};
use crate::error::{EmberError, Result};
use crate::types::{DataPoint, DataPointVector, Timestamp};

/// Delta-of-delta bucket: `(payload_bits, bias)` encodes `[-bias, bias + 1]`
type DodBucket = (u32, i64);

/// Version-1 buckets, sized for second-resolution deltas
const DOD_BUCKETS_V1: [DodBucket; 3] = [(7, 63), (9, 255), (12, 2047)];

/// Version-2 buckets, sized for millisecond-resolution deltas
const DOD_BUCKETS_V2: [DodBucket; 3] = [(9, 255), (17, 65_535), (24, 8_388_607)];

fn dod_buckets(version: u8) -> &'static [DodBucket; 3] {
    if version >= 2 {
        &DOD_BUCKETS_V2
    } else {
        &DOD_BUCKETS_V1
    }
}

/// Gorilla encoder/decoder bound to one page region
pub struct GorillaCompressor {
    version: u8,
    base: Timestamp,
    writer: BitWriter,
    count: usize,
    full: bool,

    // timestamp state
    prev_tstamp: Timestamp,
    prev_delta: i64,

    // value state
    prev_value_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl GorillaCompressor {
    pub fn new(version: u8) -> Self {
        debug_assert!(version >= 1);
        Self {
            version,
            base: 0,
            writer: BitWriter::new(0),
            count: 0,
            full: false,
            prev_tstamp: 0,
            prev_delta: 0,
            prev_value_bits: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    /// Exact bit cost of appending `(tstamp, value)` in the current state
    fn cost(&self, tstamp: Timestamp, value: f64) -> usize {
        if self.count == 0 {
            return 128;
        }

        let delta = tstamp.wrapping_sub(self.prev_tstamp) as i64;
        let dod = delta - self.prev_delta;
        let ts_cost = if dod == 0 {
            1
        } else {
            let buckets = dod_buckets(self.version);
            let mut cost = 4 + 64; // fallback: '1111' + raw
            for (i, (bits, bias)) in buckets.iter().enumerate() {
                if -bias <= dod && dod <= bias + 1 {
                    cost = (i + 2) + *bits as usize;
                    break;
                }
            }
            cost
        };

        let xor = value.to_bits() ^ self.prev_value_bits;
        let value_cost = if xor == 0 {
            1
        } else {
            let leading = xor.leading_zeros().min(31);
            let trailing = xor.trailing_zeros();
            if leading >= self.prev_leading && trailing >= self.prev_trailing {
                2 + (64 - self.prev_leading - self.prev_trailing) as usize
            } else {
                2 + 5 + 6 + (64 - leading - trailing) as usize
            }
        };

        ts_cost + value_cost
    }

    fn encode_tstamp(&mut self, page: &mut [u8], tstamp: Timestamp) {
        let delta = tstamp.wrapping_sub(self.prev_tstamp) as i64;
        let dod = delta - self.prev_delta;

        if dod == 0 {
            self.writer.write_bit(page, false);
        } else {
            let buckets = dod_buckets(self.version);
            let mut written = false;
            for (i, (bits, bias)) in buckets.iter().enumerate() {
                if -bias <= dod && dod <= bias + 1 {
                    // prefix: i+1 ones then a zero
                    self.writer.write_bits(page, (1 << (i + 2)) - 2, (i + 2) as u32);
                    self.writer.write_bits(page, (dod + bias) as u64, *bits);
                    written = true;
                    break;
                }
            }
            if !written {
                self.writer.write_bits(page, 0b1111, 4);
                self.writer.write_bits(page, dod as u64, 64);
            }
        }

        self.prev_delta = delta;
        self.prev_tstamp = tstamp;
    }

    fn encode_value(&mut self, page: &mut [u8], value: f64) {
        let bits = value.to_bits();
        let xor = bits ^ self.prev_value_bits;

        if xor == 0 {
            self.writer.write_bit(page, false);
        } else {
            self.writer.write_bit(page, true);

            let leading = xor.leading_zeros().min(31);
            let trailing = xor.trailing_zeros();

            if leading >= self.prev_leading && trailing >= self.prev_trailing {
                // meaningful bits fit the previous window
                self.writer.write_bit(page, false);
                let meaningful = 64 - self.prev_leading - self.prev_trailing;
                self.writer
                    .write_bits(page, xor >> self.prev_trailing, meaningful);
            } else {
                self.writer.write_bit(page, true);
                let meaningful = 64 - leading - trailing;
                self.writer.write_bits(page, leading as u64, 5);
                // 64 meaningful bits encode as 0 in the 6-bit field
                self.writer.write_bits(page, (meaningful & 0x3F) as u64, 6);
                self.writer.write_bits(page, xor >> trailing, meaningful);
                self.prev_leading = leading;
                self.prev_trailing = trailing;
            }
        }

        self.prev_value_bits = bits;
    }
}

impl Compressor for GorillaCompressor {
    fn init(&mut self, base: Timestamp, capacity: usize) {
        self.base = base;
        self.writer = BitWriter::new(capacity);
        self.count = 0;
        self.full = false;
        self.prev_tstamp = base;
        self.prev_delta = 0;
        self.prev_value_bits = 0;
        self.prev_leading = 0;
        self.prev_trailing = 0;
    }

    fn compress(&mut self, page: &mut [u8], tstamp: Timestamp, value: f64) -> bool {
        if self.full {
            return false;
        }

        // delta-of-delta requires non-decreasing timestamps; the caller
        // must route older samples to an out-of-order page
        if self.count > 0 && tstamp < self.prev_tstamp {
            return false;
        }

        if self.cost(tstamp, value) > self.writer.remaining() {
            self.full = true;
            return false;
        }

        if self.count == 0 {
            self.writer
                .write_bits(page, tstamp.wrapping_sub(self.base), 64);
            self.writer.write_bits(page, value.to_bits(), 64);
            self.prev_tstamp = tstamp;
            self.prev_value_bits = value.to_bits();
        } else {
            self.encode_tstamp(page, tstamp);
            self.encode_value(page, value);
        }

        self.count += 1;
        true
    }

    fn is_full(&self) -> bool {
        self.full
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn size(&self) -> usize {
        self.writer.byte_len()
    }

    fn save_position(&self) -> CompressorPosition {
        let pos = self.writer.pos();
        CompressorPosition {
            offset: (pos / 8) as u16,
            start: (pos % 8) as u8,
        }
    }

    fn save_to(&self, _dest: &mut [u8]) {
        // bits are written through to the page; nothing buffered to copy
    }

    fn restore(
        &mut self,
        page: &[u8],
        position: CompressorPosition,
        out: &mut DataPointVector,
    ) -> Result<()> {
        let end_bits = position.offset as usize * 8 + position.start as usize;
        if end_bits > page.len() * 8 {
            return Err(EmberError::CorruptStream(format!(
                "cursor at bit {} beyond page of {} bytes",
                end_bits,
                page.len()
            )));
        }

        let mut decoder = Decoder::new(self.version, self.base, page, end_bits);
        decoder.decode_all(out)?;

        // adopt the decoded state so appends can continue where the page left off
        self.count = decoder.count;
        self.prev_tstamp = decoder.prev_tstamp;
        self.prev_delta = decoder.prev_delta;
        self.prev_value_bits = decoder.prev_value_bits;
        self.prev_leading = decoder.prev_leading;
        self.prev_trailing = decoder.prev_trailing;
        self.full = false;
        self.writer = BitWriter::new(page.len());
        self.writer.set_pos(end_bits);

        Ok(())
    }

    fn uncompress(&self, page: &[u8], out: &mut DataPointVector) -> Result<()> {
        let mut decoder = Decoder::new(self.version, self.base, page, self.writer.pos());
        decoder.decode_all(out)
    }

    fn last_timestamp(&self) -> Timestamp {
        self.prev_tstamp
    }

    fn dp_count(&self) -> usize {
        self.count
    }

    fn version(&self) -> u8 {
        self.version
    }
}

/// Stateful stream decoder shared by `restore` and `uncompress`
struct Decoder<'a> {
    version: u8,
    base: Timestamp,
    reader: BitReader<'a>,
    count: usize,
    prev_tstamp: Timestamp,
    prev_delta: i64,
    prev_value_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> Decoder<'a> {
    fn new(version: u8, base: Timestamp, page: &'a [u8], end_bits: usize) -> Self {
        Self {
            version,
            base,
            reader: BitReader::new(page, end_bits),
            count: 0,
            prev_tstamp: base,
            prev_delta: 0,
            prev_value_bits: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    fn decode_all(&mut self, out: &mut DataPointVector) -> Result<()> {
        while self.reader.has_more() {
            let dp = self.decode_next()?;
            out.push(dp);
        }
        Ok(())
    }

    fn decode_next(&mut self) -> Result<DataPoint> {
        if self.count == 0 {
            let ts_rel = self.read_bits(64)?;
            let value_bits = self.read_bits(64)?;
            self.prev_tstamp = self.base.wrapping_add(ts_rel);
            self.prev_value_bits = value_bits;
            self.count = 1;
            return Ok(DataPoint::new(self.prev_tstamp, f64::from_bits(value_bits)));
        }

        let tstamp = self.decode_tstamp()?;
        let value = self.decode_value()?;
        self.count += 1;
        Ok(DataPoint::new(tstamp, value))
    }

    fn decode_tstamp(&mut self) -> Result<Timestamp> {
        let dod = if !self.read_bit()? {
            0
        } else {
            let buckets = dod_buckets(self.version);
            let mut dod = None;
            for (bits, bias) in buckets.iter() {
                if !self.read_bit()? {
                    dod = Some(self.read_bits(*bits)? as i64 - bias);
                    break;
                }
            }
            match dod {
                Some(v) => v,
                None => self.read_bits(64)? as i64,
            }
        };

        let delta = self.prev_delta + dod;
        let tstamp = self.prev_tstamp.wrapping_add(delta as u64);

        if tstamp < self.prev_tstamp {
            return Err(EmberError::CorruptStream(format!(
                "timestamp went backwards at sample {}",
                self.count
            )));
        }

        self.prev_delta = delta;
        self.prev_tstamp = tstamp;
        Ok(tstamp)
    }

    fn decode_value(&mut self) -> Result<f64> {
        if !self.read_bit()? {
            return Ok(f64::from_bits(self.prev_value_bits));
        }

        let (leading, meaningful) = if !self.read_bit()? {
            // previous window
            (
                self.prev_leading,
                64 - self.prev_leading - self.prev_trailing,
            )
        } else {
            let leading = self.read_bits(5)? as u32;
            let mut meaningful = self.read_bits(6)? as u32;
            if meaningful == 0 {
                meaningful = 64;
            }
            if leading + meaningful > 64 {
                return Err(EmberError::CorruptStream(format!(
                    "bad xor window at sample {}: leading {} meaningful {}",
                    self.count, leading, meaningful
                )));
            }
            self.prev_leading = leading;
            self.prev_trailing = 64 - leading - meaningful;
            (leading, meaningful)
        };

        let meaningful_value = self.read_bits(meaningful)?;
        let trailing = 64 - leading - meaningful;
        self.prev_value_bits ^= meaningful_value << trailing;
        Ok(f64::from_bits(self.prev_value_bits))
    }

    fn read_bit(&mut self) -> Result<bool> {
        self.reader
            .read_bit()
            .ok_or_else(|| EmberError::CorruptStream("unexpected end of stream".into()))
    }

    fn read_bits(&mut self, num_bits: u32) -> Result<u64> {
        self.reader
            .read_bits(num_bits)
            .ok_or_else(|| EmberError::CorruptStream("unexpected end of stream".into()))
    }
}
