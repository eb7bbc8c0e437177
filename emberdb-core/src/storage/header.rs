//! On-disk header records for epoch data files
//!
//! The file prefix holds one `TsdbHeader` followed by an array of
//! `PageInfo` records, one per allocatable header slot. Both are encoded
//! with explicit little-endian field codecs rather than by casting mapped
//! bytes to native structs, so widths are fixed per major version and the
//! layout survives endian and compiler differences.

use crate::compress::CompressorPosition;
use crate::types::{TimeRange, Timestamp};
use bytes::{Buf, BufMut};

/// File format major version; a mismatch is fatal on reopen
pub const MAJOR_VERSION: u16 = 1;

/// File format minor version; a mismatch only warns
pub const MINOR_VERSION: u16 = 0;

/// Default physical page size in bytes
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

const FLAG_COMPACTED: u8 = 0x01;
const FLAG_MILLISECOND: u8 = 0x02;

const FLAG_FULL: u8 = 0x01;
const FLAG_OUT_OF_ORDER: u8 = 0x02;

/// File header at offset 0 of every epoch data file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsdbHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub compacted: bool,
    pub millisecond: bool,
    pub compressor_version: u8,
    pub start_tstamp: Timestamp,
    pub end_tstamp: Timestamp,
    /// Header-slot capacity of the file
    pub page_count: u32,
    /// Next free page slot
    pub page_index: u32,
    /// Next free header slot
    pub header_index: u32,
    /// Page count the file is currently truncated to
    pub actual_pg_cnt: u32,
    pub page_size: u32,
}

impl TsdbHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 48;

    /// Serialize into the first `SIZE` bytes of `dest`
    pub fn write_to(&self, dest: &mut [u8]) {
        let mut buf = &mut dest[..Self::SIZE];
        buf.put_u16_le(self.major_version);
        buf.put_u16_le(self.minor_version);
        let mut flags = 0u8;
        if self.compacted {
            flags |= FLAG_COMPACTED;
        }
        if self.millisecond {
            flags |= FLAG_MILLISECOND;
        }
        buf.put_u8(flags);
        buf.put_u8(self.compressor_version);
        buf.put_u16_le(0); // reserved
        buf.put_u64_le(self.start_tstamp);
        buf.put_u64_le(self.end_tstamp);
        buf.put_u32_le(self.page_count);
        buf.put_u32_le(self.page_index);
        buf.put_u32_le(self.header_index);
        buf.put_u32_le(self.actual_pg_cnt);
        buf.put_u32_le(self.page_size);
        buf.put_u32_le(0); // reserved
    }

    /// Deserialize from the first `SIZE` bytes of `src`
    pub fn read_from(src: &[u8]) -> Self {
        let mut buf = &src[..Self::SIZE];
        let major_version = buf.get_u16_le();
        let minor_version = buf.get_u16_le();
        let flags = buf.get_u8();
        let compressor_version = buf.get_u8();
        buf.advance(2);
        let start_tstamp = buf.get_u64_le();
        let end_tstamp = buf.get_u64_le();
        let page_count = buf.get_u32_le();
        let page_index = buf.get_u32_le();
        let header_index = buf.get_u32_le();
        let actual_pg_cnt = buf.get_u32_le();
        let page_size = buf.get_u32_le();

        Self {
            major_version,
            minor_version,
            compacted: flags & FLAG_COMPACTED != 0,
            millisecond: flags & FLAG_MILLISECOND != 0,
            compressor_version,
            start_tstamp,
            end_tstamp,
            page_count,
            page_index,
            header_index,
            actual_pg_cnt,
            page_size,
        }
    }

    /// Time range recorded in the header
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.start_tstamp, self.end_tstamp)
    }

    /// No header slot left for allocation
    pub fn is_full(&self) -> bool {
        self.header_index >= self.page_count
    }
}

/// Per-page header record, fixed-width, indexed by header slot
///
/// `page_index == 0` marks a torn slot: a valid page can never sit in slot
/// 0 because the low slots always hold the header region itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageInfo {
    /// Physical page slot holding this block
    pub page_index: u32,
    /// Byte offset of the block within its page
    pub offset: u16,
    /// Byte length of the block region
    pub size: u16,
    /// Compressor bitstream cursor
    pub position: CompressorPosition,
    pub full: bool,
    pub out_of_order: bool,
    /// First timestamp, relative to the epoch start
    pub tstamp_from: Timestamp,
    /// Last timestamp, relative to the epoch start
    pub tstamp_to: Timestamp,
}

impl PageInfo {
    /// Encoded size in bytes
    pub const SIZE: usize = 32;

    /// Serialize into the first `SIZE` bytes of `dest`
    pub fn write_to(&self, dest: &mut [u8]) {
        let mut buf = &mut dest[..Self::SIZE];
        buf.put_u32_le(self.page_index);
        buf.put_u16_le(self.offset);
        buf.put_u16_le(self.size);
        buf.put_u16_le(self.position.offset);
        buf.put_u8(self.position.start);
        let mut flags = 0u8;
        if self.full {
            flags |= FLAG_FULL;
        }
        if self.out_of_order {
            flags |= FLAG_OUT_OF_ORDER;
        }
        buf.put_u8(flags);
        buf.put_u32_le(0); // reserved
        buf.put_u64_le(self.tstamp_from);
        buf.put_u64_le(self.tstamp_to);
    }

    /// Deserialize from the first `SIZE` bytes of `src`
    pub fn read_from(src: &[u8]) -> Self {
        let mut buf = &src[..Self::SIZE];
        let page_index = buf.get_u32_le();
        let offset = buf.get_u16_le();
        let size = buf.get_u16_le();
        let position = CompressorPosition {
            offset: buf.get_u16_le(),
            start: buf.get_u8(),
        };
        let flags = buf.get_u8();
        buf.advance(4);
        let tstamp_from = buf.get_u64_le();
        let tstamp_to = buf.get_u64_le();

        Self {
            page_index,
            offset,
            size,
            position,
            full: flags & FLAG_FULL != 0,
            out_of_order: flags & FLAG_OUT_OF_ORDER != 0,
            tstamp_from,
            tstamp_to,
        }
    }

    /// Torn-write sentinel: counters were bumped but the record never landed
    pub fn is_torn(&self) -> bool {
        self.page_index == 0
    }

    pub fn is_empty(&self) -> bool {
        self.position.offset == 0 && self.position.start == 0
    }
}

/// First page slot usable for data: the slots below it hold the file
/// header and the page-info array
pub fn first_info_index(page_count: u32, page_size: u32) -> u32 {
    let prefix = page_count as u64 * PageInfo::SIZE as u64 + TsdbHeader::SIZE as u64;
    prefix.div_ceil(page_size as u64) as u32
}
