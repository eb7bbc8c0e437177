//! In-memory handle over one compressed block
//!
//! A `PageView` bridges a page-info record, the mapped page bytes, and an
//! optional compressor. It exists in two states: disk-only (no compressor;
//! range and flags can be read without decoding) and active (compressor
//! attached; the page can be appended to or decoded).
//!
//! Views address their manager by header index and take it as an argument
//! on every operation; they never cache pointers into the mapped region,
//! so a remap cannot leave them dangling.

use super::manager::PageManager;
use crate::compress::{self, Compressor};
use crate::error::Result;
use crate::types::{DataPointVector, TimeRange, Timestamp};

/// Handle over one block in an epoch data file
pub struct PageView {
    header_idx: u32,
    /// Absolute timestamps seen by this block, both ends inclusive
    time_range: TimeRange,
    compressor: Option<Box<dyn Compressor>>,
}

impl PageView {
    /// Create a view over a freshly allocated page and write its header
    /// record. The caller attaches an encoder with `setup_compressor` and
    /// bumps the allocation counters afterwards.
    pub(crate) fn init_for_disk(
        pm: &mut PageManager,
        header_idx: u32,
        page_idx: u32,
        size: u16,
        out_of_order: bool,
    ) -> Self {
        let mut info = super::header::PageInfo::default();
        info.page_index = page_idx;
        info.offset = 0;
        info.size = size;
        info.out_of_order = out_of_order;
        pm.write_page_info(header_idx, &info);

        Self {
            header_idx,
            time_range: TimeRange::empty(),
            compressor: None,
        }
    }

    /// Open an existing page read-only; the compressor stays detached until
    /// `ensure_dp_available`
    pub(crate) fn from_disk(pm: &PageManager, header_idx: u32) -> Self {
        let info = pm.page_info(header_idx);
        let start = pm.time_range().from;
        let time_range = if info.is_empty() {
            TimeRange::empty()
        } else {
            TimeRange::new(start + info.tstamp_from, start + info.tstamp_to)
        };
        debug_assert!(
            time_range.is_empty() || pm.time_range().contains(time_range.to),
            "page range escapes the epoch"
        );

        Self {
            header_idx,
            time_range,
            compressor: None,
        }
    }

    /// Attach a fresh encoder of `version` pinned at this view's page bytes
    pub(crate) fn setup_compressor(&mut self, pm: &PageManager, version: u8) -> Result<()> {
        let info = pm.page_info(self.header_idx);
        let version = if info.out_of_order { 0 } else { version };
        let mut compressor = compress::create(version)?;
        compressor.init(pm.time_range().from, info.size as usize);
        self.compressor = Some(compressor);
        Ok(())
    }

    /// Lazily materialize samples: attach a decoder of the recorded version
    /// and decode up to the saved cursor. Idempotent once active.
    pub fn ensure_dp_available(
        &mut self,
        pm: &PageManager,
        out: Option<&mut DataPointVector>,
    ) -> Result<()> {
        if self.compressor.is_some() {
            return Ok(());
        }

        let info = pm.page_info(self.header_idx);
        let version = if info.out_of_order {
            0
        } else {
            pm.compressor_version()
        };
        let mut compressor = compress::create(version)?;
        compressor.init(pm.time_range().from, info.size as usize);

        let page = pm.page_bytes(&info);
        match out {
            Some(dps) => compressor.restore(page, info.position, dps)?,
            None => {
                let mut dps = DataPointVector::new();
                compressor.restore(page, info.position, &mut dps)?;
            }
        }

        self.compressor = Some(compressor);
        Ok(())
    }

    /// Append a sample; `false` means the page is full or the timestamp is
    /// out of order for this encoder
    pub fn add_data_point(&mut self, pm: &mut PageManager, tstamp: Timestamp, value: f64) -> bool {
        let Some(compressor) = self.compressor.as_mut() else {
            return false;
        };
        let info = pm.page_info(self.header_idx);
        let page = pm.page_bytes_mut(&info);
        let ok = compressor.compress(page, tstamp, value);
        if ok {
            self.time_range.add_time(tstamp);
        }
        ok
    }

    /// Flush cursor and relative timestamps to the header record; copy the
    /// bitstream for V0 encoders (or when `copy_data` forces it). Must run
    /// before an external reader may see the page. Idempotent.
    pub fn persist(&mut self, pm: &mut PageManager, copy_data: bool) {
        let Some(compressor) = self.compressor.as_ref() else {
            return;
        };

        let mut info = pm.page_info(self.header_idx);

        if compressor.version() == 0 || copy_data {
            let page = pm.page_bytes_mut(&info);
            compressor.save_to(page);
        }

        let start = pm.time_range().from;
        info.position = compressor.save_position();
        // full is sticky: shrink_to_fit marks partially-used pages full
        info.full = info.full || compressor.is_full();
        if self.time_range.is_empty() {
            info.tstamp_from = 0;
            info.tstamp_to = 0;
        } else {
            info.tstamp_from = self.time_range.from - start;
            info.tstamp_to = self.time_range.to - start;
        }
        pm.write_page_info(self.header_idx, &info);
    }

    /// Persist, release the kernel pages, and drop the encoder once full
    pub fn flush(&mut self, pm: &mut PageManager) {
        if self.compressor.is_none() {
            return;
        }

        self.persist(pm, false);

        let info = pm.page_info(self.header_idx);
        pm.advise_dont_need(&info);

        if info.full {
            self.compressor = None;
        }
    }

    /// Clamp the header size to the encoded bytes, mark the page full, and
    /// flush. Used by the allocator at file close.
    pub fn shrink_to_fit(&mut self, pm: &mut PageManager) {
        let version = match self.compressor.as_ref() {
            Some(compressor) => compressor.version(),
            None => return,
        };

        self.persist(pm, false);

        let mut info = pm.page_info(self.header_idx);
        let mut size = info.position.offset as u32;
        if info.position.start != 0 {
            size += 1;
        }
        if version == 0 {
            // the V0 cursor counts samples of 16 bytes each
            size *= 16;
        }
        info.size = size as u16;
        info.full = true;
        pm.write_page_info(self.header_idx, &info);

        self.flush(pm);
    }

    /// Relocate this view's bytes immediately after `dst_header_idx`'s block
    /// inside the same physical page. Compaction only.
    pub(crate) fn merge_after(&mut self, pm: &mut PageManager, dst_header_idx: u32) -> Result<()> {
        debug_assert!(self.compressor.is_some(), "merge_after needs an active view");
        let size = self.encoded_size();
        let Some(src) = self.raw_bytes(pm, size) else {
            return Ok(());
        };

        let dst = pm.page_info(dst_header_idx);
        let mut info = pm.page_info(self.header_idx);
        info.page_index = dst.page_index;
        info.offset = dst.offset + dst.size;
        info.size = size as u16;
        pm.write_page_info(self.header_idx, &info);
        pm.page_bytes_mut(&info)[..size].copy_from_slice(&src);

        self.persist(pm, false);
        Ok(())
    }

    /// Relocate this view's bytes to the start of page slot `dst_page_idx`.
    /// Compaction only.
    pub(crate) fn copy_to(&mut self, pm: &mut PageManager, dst_page_idx: u32) -> Result<()> {
        debug_assert!(self.compressor.is_some(), "copy_to needs an active view");
        let size = self.encoded_size();
        let Some(src) = self.raw_bytes(pm, size) else {
            return Ok(());
        };

        let mut info = pm.page_info(self.header_idx);
        info.page_index = dst_page_idx;
        info.offset = 0;
        info.size = size as u16;
        pm.write_page_info(self.header_idx, &info);
        pm.page_bytes_mut(&info)[..size].copy_from_slice(&src);

        self.persist(pm, false);
        Ok(())
    }

    /// Current block bytes, from the encoder's buffer (V0) or the page
    fn raw_bytes(&self, pm: &PageManager, size: usize) -> Option<Vec<u8>> {
        let compressor = self.compressor.as_ref()?;
        if compressor.version() == 0 {
            let mut bytes = vec![0u8; size];
            compressor.save_to(&mut bytes);
            Some(bytes)
        } else {
            let info = pm.page_info(self.header_idx);
            Some(pm.page_bytes(&info)[..size].to_vec())
        }
    }

    /// Decode everything in this block; the view must be active
    pub fn get_all_data_points(&self, pm: &PageManager, out: &mut DataPointVector) -> Result<()> {
        if let Some(compressor) = self.compressor.as_ref() {
            let info = pm.page_info(self.header_idx);
            compressor.uncompress(pm.page_bytes(&info), out)?;
        }
        Ok(())
    }

    pub fn is_full(&self, pm: &PageManager) -> bool {
        match self.compressor.as_ref() {
            Some(compressor) => compressor.is_full(),
            None => pm.page_info(self.header_idx).full,
        }
    }

    pub fn is_empty(&self, pm: &PageManager) -> bool {
        match self.compressor.as_ref() {
            Some(compressor) => compressor.is_empty(),
            None => pm.page_info(self.header_idx).is_empty(),
        }
    }

    pub fn is_out_of_order(&self, pm: &PageManager) -> bool {
        pm.page_info(self.header_idx).out_of_order
    }

    /// Timestamp of the most recent sample; the epoch start when empty
    pub fn last_tstamp(&self) -> Timestamp {
        self.compressor
            .as_ref()
            .map(|c| c.last_timestamp())
            .unwrap_or(self.time_range.to)
    }

    pub fn dp_count(&self) -> usize {
        self.compressor.as_ref().map(|c| c.dp_count()).unwrap_or(0)
    }

    /// Encoded bytes held by the attached compressor
    pub(crate) fn encoded_size(&self) -> usize {
        self.compressor.as_ref().map(|c| c.size()).unwrap_or(0)
    }

    pub fn header_index(&self) -> u32 {
        self.header_idx
    }

    /// Global ordering key across all files of the epoch
    pub fn get_page_order(&self, pm: &PageManager) -> u64 {
        pm.id() as u64 * pm.page_count() as u64 + pm.page_info(self.header_idx).page_index as u64
    }

    pub fn time_range(&self) -> TimeRange {
        self.time_range
    }

    pub fn has_compressor(&self) -> bool {
        self.compressor.is_some()
    }
}
