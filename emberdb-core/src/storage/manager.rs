//! Page manager: owner of one memory-mapped epoch data file
//!
//! The file holds a `TsdbHeader`, a `PageInfo` array, and fixed-size data
//! pages. Allocation counters live inside the mapped header so they persist
//! with the data; a page-info record is always written before the counters
//! that cover it are bumped, which is what makes torn-write recovery on
//! reopen possible.
//!
//! Mutating operations take `&mut self`; the epoch coordinator wraps each
//! manager in a mutex, so the borrow checker enforces that a page has one
//! writer until it is marked full.

use super::header::{self, PageInfo, TsdbHeader, MAJOR_VERSION, MINOR_VERSION};
use super::page::PageView;
use crate::compress;
use crate::error::{EmberError, Result};
use crate::types::TimeRange;
use memmap2::{Advice, MmapMut, MmapOptions, RemapOptions, UncheckedAdvice};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Smallest tail worth reusing when packing compacted blocks
const MIN_TAIL_BYTES: u16 = 12;

/// Creation parameters for a new epoch data file
#[derive(Debug, Clone)]
pub struct PageManagerOptions {
    /// Header-slot capacity per data file
    pub page_count: u32,
    /// Physical page size in bytes
    pub page_size: u32,
    /// Encoder version for new files
    pub compressor_version: u8,
    /// Millisecond timestamp resolution
    pub millisecond: bool,
}

impl Default for PageManagerOptions {
    fn default() -> Self {
        Self {
            page_count: 4096,
            page_size: header::DEFAULT_PAGE_SIZE,
            compressor_version: compress::DEFAULT_COMPRESSOR_VERSION,
            millisecond: false,
        }
    }
}

/// Owner of one mmap-backed data file for one epoch
pub struct PageManager {
    file_name: PathBuf,
    file: File,
    mmap: MmapMut,
    id: u32,
    time_range: TimeRange,
    page_size: u32,
    page_count: u32,
    compressor_version: u8,
    compacted: bool,
    millisecond: bool,
    total_size: u64,
}

impl PageManager {
    /// Open or create the data file for `range`, shard `id`
    ///
    /// New files get a populated header and a zeroed page-info array.
    /// Existing files are validated (major version and timestamp resolution
    /// are fatal, minor and compressor versions only warn) and repaired:
    /// trailing header slots whose `page_index` never landed are discarded
    /// by rewinding the allocation counters.
    pub fn open(
        file_name: PathBuf,
        range: TimeRange,
        id: u32,
        opts: &PageManagerOptions,
    ) -> Result<Self> {
        debug_assert!(range.from < range.to);
        debug_assert!(opts.page_size <= u16::MAX as u32);

        // reject unknown encoder versions before they reach a file header
        compress::create(opts.compressor_version)?;

        info!("opening data file {}", file_name.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&file_name)
            .map_err(|e| {
                error!("failed to open file {}: {}", file_name.display(), e);
                EmberError::Io(e)
            })?;

        let file_len = file.metadata()?.len();
        let is_new = file_len == 0;

        let mut total_size = opts.page_count as u64 * opts.page_size as u64;
        if !is_new && file_len != total_size {
            // a shrunk file keeps its truncated length
            total_size = file_len;
        }
        file.set_len(total_size)?;

        let mmap = unsafe { MmapOptions::new().len(total_size as usize).map_mut(&file)? };
        if let Err(e) = mmap.advise(Advice::Random) {
            warn!("madvise(RANDOM) failed on {}: {}", file_name.display(), e);
        }

        let mut pm = Self {
            file_name,
            file,
            mmap,
            id,
            time_range: range,
            page_size: opts.page_size,
            page_count: opts.page_count,
            compressor_version: opts.compressor_version,
            compacted: false,
            millisecond: opts.millisecond,
            total_size,
        };

        if is_new {
            pm.init_new_file()?;
        } else {
            pm.validate_existing_file()?;
            pm.recover_torn_writes();
        }

        debug!(
            "page count = {}, page index = {}",
            pm.page_count,
            pm.page_index()
        );
        Ok(pm)
    }

    fn init_new_file(&mut self) -> Result<()> {
        let th = TsdbHeader {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            compacted: false,
            millisecond: self.millisecond,
            compressor_version: self.compressor_version,
            start_tstamp: self.time_range.from,
            end_tstamp: self.time_range.to,
            page_count: self.page_count,
            page_index: self.first_info_index(),
            header_index: 0,
            actual_pg_cnt: self.page_count,
            page_size: self.page_size,
        };
        self.write_header(&th);

        let info_end = TsdbHeader::SIZE + self.page_count as usize * PageInfo::SIZE;
        self.mmap[TsdbHeader::SIZE..info_end].fill(0);
        self.mmap.flush_range(0, info_end)?;
        Ok(())
    }

    fn validate_existing_file(&mut self) -> Result<()> {
        let th = self.header();

        if th.major_version != MAJOR_VERSION {
            error!(
                "file major version {}, our major version {}",
                th.major_version, MAJOR_VERSION
            );
            return Err(EmberError::VersionMismatch {
                file: th.major_version,
                ours: MAJOR_VERSION,
            });
        }
        if th.minor_version != MINOR_VERSION {
            warn!(
                "file minor version {}, our minor version {}",
                th.minor_version, MINOR_VERSION
            );
        }
        if th.compressor_version != self.compressor_version {
            warn!(
                "file compressor version {}, ours {}, switching to {}",
                th.compressor_version, self.compressor_version, th.compressor_version
            );
            self.compressor_version = th.compressor_version;
        }
        if th.millisecond != self.millisecond {
            error!("timestamp resolution in config differs from data file");
            return Err(EmberError::ResolutionMismatch);
        }

        self.page_count = th.page_count;
        self.page_size = th.page_size;
        self.compacted = th.compacted;
        self.total_size = th.actual_pg_cnt as u64 * th.page_size as u64;
        Ok(())
    }

    /// An abnormal shutdown can persist bumped counters without the page
    /// header that goes with them; rewind past any trailing zeroed slots
    fn recover_torn_writes(&mut self) {
        let mut th = self.header();
        let mut torn = 0u32;

        while th.header_index > torn {
            let info = self.page_info(th.header_index - torn - 1);
            if info.is_torn() {
                torn += 1;
            } else {
                break;
            }
        }

        if torn > 0 {
            warn!("last {} pages are not initialized, will be discarded", torn);
            th.header_index -= torn;
            th.page_index -= torn;
            self.write_header(&th);
        }
    }

    // ---- mapped-header access -------------------------------------------

    pub(crate) fn header(&self) -> TsdbHeader {
        TsdbHeader::read_from(&self.mmap)
    }

    pub(crate) fn write_header(&mut self, th: &TsdbHeader) {
        th.write_to(&mut self.mmap);
    }

    pub(crate) fn page_info(&self, header_idx: u32) -> PageInfo {
        debug_assert!(header_idx < self.page_count);
        let at = TsdbHeader::SIZE + header_idx as usize * PageInfo::SIZE;
        PageInfo::read_from(&self.mmap[at..])
    }

    pub(crate) fn write_page_info(&mut self, header_idx: u32, info: &PageInfo) {
        debug_assert!(header_idx < self.page_count);
        debug_assert!(info.offset as u32 + info.size as u32 <= self.page_size);
        let at = TsdbHeader::SIZE + header_idx as usize * PageInfo::SIZE;
        info.write_to(&mut self.mmap[at..]);
    }

    /// Bytes of the block described by `info`
    pub(crate) fn page_bytes(&self, info: &PageInfo) -> &[u8] {
        let at = info.page_index as usize * self.page_size as usize + info.offset as usize;
        &self.mmap[at..at + info.size as usize]
    }

    pub(crate) fn page_bytes_mut(&mut self, info: &PageInfo) -> &mut [u8] {
        let at = info.page_index as usize * self.page_size as usize + info.offset as usize;
        &mut self.mmap[at..at + info.size as usize]
    }

    /// Release the kernel cache for one physical page; failures are logged
    /// and suppressed
    pub(crate) fn advise_dont_need(&self, info: &PageInfo) {
        let at = info.page_index as usize * self.page_size as usize;
        // MAP_SHARED file-backed mapping: DONT_NEED only drops clean pages
        let rc = unsafe {
            self.mmap
                .unchecked_advise_range(UncheckedAdvice::DontNeed, at, self.page_size as usize)
        };
        if let Err(e) = rc {
            warn!("madvise(DONTNEED) failed on {}: {}", self.file_name.display(), e);
        }
    }

    // ---- allocation -----------------------------------------------------

    /// Claim the next header and page slot and return a writable view, or
    /// `None` when the file is out of headers or pages
    pub fn get_free_page_on_disk(&mut self, ooo: bool) -> Option<PageView> {
        let mut th = self.header();
        if th.page_index >= th.actual_pg_cnt || th.header_index >= th.page_count {
            debug!("running out of pages in {}", self.file_name.display());
            return None;
        }

        let header_idx = th.header_index;
        let page_idx = th.page_index;
        let mut view =
            PageView::init_for_disk(self, header_idx, page_idx, self.page_size as u16, ooo);
        let version = if ooo { 0 } else { self.compressor_version };
        view.setup_compressor(self, version).ok()?;

        th.page_index += 1;
        th.header_index += 1;
        self.write_header(&th);

        Some(view)
    }

    /// Allocation variant for compaction: reuse the previous block's page
    /// tail when at least `MIN_TAIL_BYTES` remain there
    pub fn get_free_page_for_compaction(&mut self) -> Option<PageView> {
        let mut th = self.header();
        if th.page_index >= th.actual_pg_cnt || th.header_index >= th.page_count {
            debug!("running out of pages in {}", self.file_name.display());
            return None;
        }

        let header_idx = th.header_index;
        let page_idx = th.page_index;
        let mut view =
            PageView::init_for_disk(self, header_idx, page_idx, self.page_size as u16, false);

        th.page_index += 1;
        th.header_index += 1;
        self.write_header(&th);

        if header_idx > 0 {
            let prev = self.page_info(header_idx - 1);
            let tail = prev.offset + prev.size;
            let mut info = self.page_info(header_idx);
            if self.page_size as u16 - tail >= MIN_TAIL_BYTES {
                info.page_index = prev.page_index;
                info.offset = tail;
                info.size = self.page_size as u16 - tail;
            } else {
                info.page_index = prev.page_index + 1;
            }
            self.write_page_info(header_idx, &info);
        }

        view.setup_compressor(self, self.compressor_version).ok()?;
        Some(view)
    }

    /// Reopen an occupied header slot as a disk-only view
    pub fn get_the_page_on_disk(&self, header_idx: u32) -> Option<PageView> {
        if header_idx >= self.header_index() {
            return None;
        }
        Some(PageView::from_disk(self, header_idx))
    }

    // ---- durability -----------------------------------------------------

    /// msync the used prefix, then release the kernel cache. Transient
    /// failures are logged and suppressed; the data stays in the page cache.
    pub fn flush(&self, sync: bool) {
        let th = self.header();
        let mut len = th.page_index as u64 * self.page_size as u64;
        if len > self.total_size {
            // can happen after compaction truncated the file
            len = self.total_size;
        }

        let rc = if sync {
            self.mmap.flush_range(0, len as usize)
        } else {
            self.mmap.flush_async_range(0, len as usize)
        };
        if let Err(e) = rc {
            info!("msync failed on {}: {}", self.file_name.display(), e);
        }

        let rc = unsafe { self.mmap.unchecked_advise(UncheckedAdvice::DontNeed) };
        if let Err(e) = rc {
            info!("madvise(DONTNEED) failed on {}: {}", self.file_name.display(), e);
        }
    }

    /// Synchronous msync of the used prefix, without releasing the cache
    pub fn persist(&self) {
        let th = self.header();
        let len = (th.page_index as u64 * self.page_size as u64).min(self.total_size);
        if let Err(e) = self.mmap.flush_range(0, len as usize) {
            info!("msync failed on {}: {}", self.file_name.display(), e);
        }
    }

    fn resize_to(&mut self, new_total: u64) -> Result<()> {
        if new_total == self.total_size {
            return Ok(());
        }

        self.file.set_len(new_total).map_err(|e| {
            error!("failed to resize {}: {}", self.file_name.display(), e);
            EmberError::Io(e)
        })?;
        unsafe {
            self.mmap
                .remap(new_total as usize, RemapOptions::new().may_move(true))?;
        }
        self.total_size = new_total;
        Ok(())
    }

    /// Truncate the file to the pages actually used, derived from the last
    /// allocated header. Called on shutdown.
    pub fn shrink_to_fit(&mut self) -> Result<()> {
        let mut th = self.header();
        let last = if th.header_index == 0 {
            self.first_info_index()
        } else {
            self.page_info(th.header_index - 1).page_index + 1
        };

        th.actual_pg_cnt = last;
        th.compacted = true;
        self.write_header(&th);
        self.compacted = true;

        let new_total = last as u64 * self.page_size as u64;
        debug!("shrink from {} to {}", self.total_size, new_total);
        self.resize_to(new_total)
    }

    // ---- compaction -----------------------------------------------------

    /// Repack partially filled pages into fewer physical pages and truncate.
    ///
    /// Nothing calls this automatically; enable `tsdb.compact.enabled` and
    /// drive it from the epoch once validated. Returns true when the file
    /// was truncated.
    pub fn compact(&mut self) -> Result<bool> {
        let header_count = self.header_index();
        let mut views: Vec<PageView> = (0..header_count)
            .map(|h| PageView::from_disk(self, h))
            .collect();

        let mut empty_slots: BTreeSet<u32> = BTreeSet::new();
        let mut partial: Vec<usize> = Vec::new();
        let mut used: Vec<usize> = Vec::new();

        for (i, view) in views.iter().enumerate() {
            let info = self.page_info(view.header_index());
            if info.is_empty() {
                empty_slots.insert(info.page_index);
            } else {
                used.push(i);
                if !info.full {
                    partial.push(i);
                }
            }
        }

        let budget = (self.page_size - MIN_TAIL_BYTES as u32) as usize;

        // merge subsets of partial blocks into single physical pages
        while partial.len() > 1 {
            let mut sizes = Vec::with_capacity(partial.len());
            for &i in &partial {
                views[i].ensure_dp_available(self, None)?;
                sizes.push(views[i].encoded_size());
            }

            let subset = max_subset(&sizes, budget);
            if subset.len() < 2 {
                break;
            }

            // first member anchors the chain; drop it into a lower empty
            // slot when one is available
            let dst_i = partial[subset[0]];
            {
                let idx = views[dst_i].header_index();
                let mut info = self.page_info(idx);
                info.size = views[dst_i].encoded_size() as u16;
                self.write_page_info(idx, &info);
            }
            let dst_slot = self.page_info(views[dst_i].header_index()).page_index;
            if let Some(&slot) = empty_slots.iter().next() {
                if slot < dst_slot {
                    empty_slots.remove(&slot);
                    empty_slots.insert(dst_slot);
                    views[dst_i].copy_to(self, slot)?;
                }
            }

            let mut dst_idx = views[dst_i].header_index();
            for &s in &subset[1..] {
                let src_i = partial[s];
                let src_slot = self.page_info(views[src_i].header_index()).page_index;
                views[src_i].merge_after(self, dst_idx)?;
                empty_slots.insert(src_slot);
                dst_idx = views[src_i].header_index();
            }

            let mut k = 0;
            partial.retain(|_| {
                let keep = !subset.contains(&k);
                k += 1;
                keep
            });
        }

        // move blocks down into vacated pages, smallest slot first; only
        // blocks that own their page exclusively can relocate
        loop {
            let Some(&empty) = empty_slots.iter().next() else {
                break;
            };

            let mut slot_owners: std::collections::HashMap<u32, u32> =
                std::collections::HashMap::new();
            for &i in &used {
                let slot = self.page_info(views[i].header_index()).page_index;
                *slot_owners.entry(slot).or_insert(0) += 1;
            }

            let candidate = used
                .iter()
                .copied()
                .filter(|&i| {
                    let slot = self.page_info(views[i].header_index()).page_index;
                    slot > empty && slot_owners.get(&slot) == Some(&1)
                })
                .max_by_key(|&i| self.page_info(views[i].header_index()).page_index);

            let Some(cand) = candidate else {
                break;
            };

            empty_slots.remove(&empty);
            let old_slot = self.page_info(views[cand].header_index()).page_index;
            views[cand].ensure_dp_available(self, None)?;
            views[cand].copy_to(self, empty)?;
            empty_slots.insert(old_slot);
        }

        // truncate past the highest page still holding data
        let first = self.first_info_index();
        let mut max_used = first.saturating_sub(1);
        for &i in &used {
            max_used = max_used.max(self.page_info(views[i].header_index()).page_index);
        }

        let last = max_used + 1;
        let mut th = self.header();
        th.page_index = last;
        th.actual_pg_cnt = last;
        th.compacted = true;
        self.write_header(&th);
        self.compacted = true;

        let truncated = last as u64 * (self.page_size as u64) < self.total_size;
        self.resize_to(last as u64 * self.page_size as u64)?;
        self.flush(true);
        Ok(truncated)
    }

    // ---- accessors ------------------------------------------------------

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn file_name(&self) -> &PathBuf {
        &self.file_name
    }

    pub fn time_range(&self) -> TimeRange {
        self.time_range
    }

    pub fn compressor_version(&self) -> u8 {
        self.compressor_version
    }

    pub fn is_compacted(&self) -> bool {
        self.compacted
    }

    pub fn is_millisecond(&self) -> bool {
        self.millisecond
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn page_index(&self) -> u32 {
        self.header().page_index
    }

    pub fn header_index(&self) -> u32 {
        self.header().header_index
    }

    pub fn actual_page_count(&self) -> u32 {
        self.header().actual_pg_cnt
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn first_info_index(&self) -> u32 {
        header::first_info_index(self.page_count, self.page_size)
    }

    /// Share of truncated-to pages already allocated
    pub fn get_page_percent_used(&self) -> f64 {
        let th = self.header();
        if th.actual_pg_cnt == 0 {
            return 0.0;
        }
        th.page_index as f64 / th.actual_pg_cnt as f64 * 100.0
    }
}

/// Pick indices whose sizes sum as close to `budget` as possible without
/// exceeding it (best-fit-under-budget for one physical page)
fn max_subset(sizes: &[usize], budget: usize) -> Vec<usize> {
    // classic 0/1 subset-sum over the byte budget with parent links
    let mut dp: Vec<Option<(usize, usize)>> = vec![None; budget + 1];
    let mut reachable = vec![false; budget + 1];
    reachable[0] = true;
    let mut best = 0;

    for (i, &size) in sizes.iter().enumerate() {
        if size == 0 || size > budget {
            continue;
        }
        for sum in (size..=budget).rev() {
            if !reachable[sum] && reachable[sum - size] {
                reachable[sum] = true;
                dp[sum] = Some((i, sum - size));
                best = best.max(sum);
            }
        }
    }

    let mut subset = Vec::new();
    let mut sum = best;
    while sum > 0 {
        match dp[sum] {
            Some((i, prev)) => {
                subset.push(i);
                sum = prev;
            }
            None => break,
        }
    }
    subset.sort_unstable();
    subset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataPointVector;
    use std::fs;
    use tempfile::TempDir;

    fn opts(page_count: u32, page_size: u32, version: u8) -> PageManagerOptions {
        PageManagerOptions {
            page_count,
            page_size,
            compressor_version: version,
            millisecond: false,
        }
    }

    fn open(dir: &TempDir, name: &str, range: TimeRange, o: &PageManagerOptions) -> PageManager {
        PageManager::open(dir.path().join(name), range, 0, o).unwrap()
    }

    #[test]
    fn test_fresh_file_single_page_roundtrip() {
        let dir = TempDir::new().unwrap();
        let range = TimeRange::new(1000, 2000);
        let o = opts(64, 4096, 1);

        {
            let mut pm = open(&dir, "epoch.dat", range, &o);
            assert_eq!(pm.first_info_index(), 1);
            assert_eq!(pm.page_index(), 1);
            assert_eq!(pm.header_index(), 0);

            let mut view = pm.get_free_page_on_disk(false).unwrap();
            assert!(view.add_data_point(&mut pm, 1000, 1.0));
            assert!(view.add_data_point(&mut pm, 1001, 2.0));
            assert!(view.add_data_point(&mut pm, 1002, 3.0));
            view.persist(&mut pm, false);
            pm.persist();
        }

        // reopen and query the range back
        let pm = open(&dir, "epoch.dat", range, &o);
        assert_eq!(pm.header_index(), 1);

        let mut view = pm.get_the_page_on_disk(0).unwrap();
        let mut dps = DataPointVector::new();
        view.ensure_dp_available(&pm, Some(&mut dps)).unwrap();

        let query = TimeRange::new(1000, 1003);
        let hits: Vec<_> = dps.iter().filter(|dp| query.contains(dp.timestamp)).collect();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].value, 1.0);
        assert_eq!(hits[1].value, 2.0);
        assert_eq!(hits[2].value, 3.0);
    }

    #[test]
    fn test_counter_invariants() {
        let dir = TempDir::new().unwrap();
        let range = TimeRange::new(0, 10_000);
        let o = opts(64, 4096, 1);
        let mut pm = open(&dir, "inv.dat", range, &o);

        for _ in 0..5 {
            let mut view = pm.get_free_page_on_disk(false).unwrap();
            assert!(view.add_data_point(&mut pm, 10, 1.0));
            view.persist(&mut pm, false);
        }

        assert!(pm.first_info_index() <= pm.page_index());
        assert!(pm.page_index() <= pm.actual_page_count());
        assert!(pm.actual_page_count() <= pm.page_count());
        assert!(pm.header_index() <= pm.page_count());

        for h in 0..pm.header_index() {
            let info = pm.page_info(h);
            assert!(info.page_index < pm.page_index());
            assert!(info.offset as u32 + info.size as u32 <= pm.page_size());
            assert!(info.tstamp_from <= info.tstamp_to);
            assert!(info.tstamp_to <= range.to - range.from);
        }
    }

    #[test]
    fn test_torn_write_recovery() {
        let dir = TempDir::new().unwrap();
        let range = TimeRange::new(0, 1000);
        let o = opts(64, 4096, 1);
        let path = dir.path().join("torn.dat");

        {
            let mut pm = PageManager::open(path.clone(), range, 0, &o).unwrap();
            let mut view = pm.get_free_page_on_disk(false).unwrap();
            assert!(view.add_data_point(&mut pm, 5, 1.0));
            view.persist(&mut pm, false);
            pm.persist();
        }

        // simulate a crash between bumping the counters for a second page
        // and initializing its header record
        {
            let mut bytes = fs::read(&path).unwrap();
            let mut th = TsdbHeader::read_from(&bytes);
            assert_eq!(th.header_index, 1);
            th.header_index = 2;
            th.page_index += 1;
            th.write_to(&mut bytes);
            fs::write(&path, &bytes).unwrap();
        }

        let pm = PageManager::open(path, range, 0, &o).unwrap();
        assert_eq!(pm.header_index(), 1);
        assert_eq!(pm.page_index(), pm.first_info_index() + 1);

        // the surviving page still decodes
        let mut view = pm.get_the_page_on_disk(0).unwrap();
        let mut dps = DataPointVector::new();
        view.ensure_dp_available(&pm, Some(&mut dps)).unwrap();
        assert_eq!(dps.len(), 1);
    }

    #[test]
    fn test_page_full_allocates_next() {
        let dir = TempDir::new().unwrap();
        let range = TimeRange::new(0, 100_000);
        let o = opts(64, 64, 1); // tiny pages fill fast
        let mut pm = open(&dir, "full.dat", range, &o);

        let mut view = pm.get_free_page_on_disk(false).unwrap();
        let mut ts = 0u64;
        loop {
            if !view.add_data_point(&mut pm, ts, ts as f64 * 1.3) {
                break;
            }
            ts += 17;
        }
        assert!(view.is_full(&pm));

        view.persist(&mut pm, false);
        assert!(pm.page_info(view.header_index()).full);

        // the rejected sample lands on a fresh page
        let mut next = pm.get_free_page_on_disk(false).unwrap();
        assert!(next.add_data_point(&mut pm, ts, ts as f64 * 1.3));
        assert_eq!(pm.header_index(), 2);
    }

    #[test]
    fn test_out_of_order_page_uses_v0() {
        let dir = TempDir::new().unwrap();
        let range = TimeRange::new(0, 10_000);
        let o = opts(64, 4096, 1);
        let mut pm = open(&dir, "ooo.dat", range, &o);

        let mut view = pm.get_free_page_on_disk(true).unwrap();
        assert!(view.is_out_of_order(&pm));
        assert!(view.add_data_point(&mut pm, 500, 1.0));
        assert!(view.add_data_point(&mut pm, 100, 2.0)); // older is fine here
        view.persist(&mut pm, false);

        // reopen decodes with the per-page V0 encoder despite the file
        // being V1
        let mut reopened = pm.get_the_page_on_disk(0).unwrap();
        let mut dps = DataPointVector::new();
        reopened.ensure_dp_available(&pm, Some(&mut dps)).unwrap();
        assert_eq!(dps.len(), 2);
        assert_eq!(dps[0].timestamp, 500);
        assert_eq!(dps[1].timestamp, 100);
    }

    #[test]
    fn test_out_of_space() {
        let dir = TempDir::new().unwrap();
        let range = TimeRange::new(0, 1000);
        // page_count 2 with a 4 KiB page: one slot for the header region,
        // one data page
        let o = opts(2, 4096, 1);
        let mut pm = open(&dir, "small.dat", range, &o);

        assert!(pm.get_free_page_on_disk(false).is_some());
        assert!(pm.get_free_page_on_disk(false).is_none());
    }

    #[test]
    fn test_shrink_to_fit() {
        let dir = TempDir::new().unwrap();
        let range = TimeRange::new(0, 100_000);
        let o = opts(1024, 4096, 1);
        let path = dir.path().join("shrink.dat");

        let first;
        {
            let mut pm = PageManager::open(path.clone(), range, 0, &o).unwrap();
            first = pm.first_info_index();
            for i in 0..10u64 {
                let mut view = pm.get_free_page_on_disk(false).unwrap();
                assert!(view.add_data_point(&mut pm, i * 10, i as f64));
                view.shrink_to_fit(&mut pm);
            }
            pm.shrink_to_fit().unwrap();
            pm.persist();
            assert_eq!(pm.actual_page_count(), first + 10);
        }

        let on_disk = fs::metadata(&path).unwrap().len();
        assert_eq!(on_disk, (first + 10) as u64 * 4096);

        // reopen succeeds and keeps the truncated size
        let pm = PageManager::open(path, range, 0, &o).unwrap();
        assert_eq!(pm.actual_page_count(), first + 10);
        assert_eq!(pm.total_size(), (first + 10) as u64 * 4096);
        assert!(pm.is_compacted());
    }

    #[test]
    fn test_compressor_version_drift() {
        let dir = TempDir::new().unwrap();
        let range = TimeRange::new(0, 1000);
        let path = dir.path().join("drift.dat");

        {
            let mut pm = PageManager::open(path.clone(), range, 0, &opts(64, 4096, 1)).unwrap();
            let mut view = pm.get_free_page_on_disk(false).unwrap();
            assert!(view.add_data_point(&mut pm, 10, 1.0));
            view.persist(&mut pm, false);
            pm.persist();
        }

        // process default moved to V2; the file's V1 wins
        let pm = PageManager::open(path, range, 0, &opts(64, 4096, 2)).unwrap();
        assert_eq!(pm.compressor_version(), 1);
    }

    #[test]
    fn test_major_version_mismatch_is_fatal() {
        let dir = TempDir::new().unwrap();
        let range = TimeRange::new(0, 1000);
        let o = opts(64, 4096, 1);
        let path = dir.path().join("major.dat");

        {
            let _pm = PageManager::open(path.clone(), range, 0, &o).unwrap();
        }

        {
            let mut bytes = fs::read(&path).unwrap();
            let mut th = TsdbHeader::read_from(&bytes);
            th.major_version += 1;
            th.write_to(&mut bytes);
            fs::write(&path, &bytes).unwrap();
        }

        match PageManager::open(path, range, 0, &o) {
            Err(EmberError::VersionMismatch { file, ours }) => {
                assert_eq!(file, MAJOR_VERSION + 1);
                assert_eq!(ours, MAJOR_VERSION);
            }
            other => panic!("expected version mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_resolution_mismatch_is_fatal() {
        let dir = TempDir::new().unwrap();
        let range = TimeRange::new(0, 1000);
        let path = dir.path().join("res.dat");

        {
            let _pm = PageManager::open(path.clone(), range, 0, &opts(64, 4096, 1)).unwrap();
        }

        let ms = PageManagerOptions {
            millisecond: true,
            ..opts(64, 4096, 1)
        };
        assert!(matches!(
            PageManager::open(path, range, 0, &ms),
            Err(EmberError::ResolutionMismatch)
        ));
    }

    #[test]
    fn test_persist_idempotent() {
        let dir = TempDir::new().unwrap();
        let range = TimeRange::new(0, 1000);
        let o = opts(64, 4096, 1);
        let mut pm = open(&dir, "idem.dat", range, &o);

        let mut view = pm.get_free_page_on_disk(false).unwrap();
        assert!(view.add_data_point(&mut pm, 7, 1.5));
        view.persist(&mut pm, false);
        let snap1 = pm.page_info(0);
        view.persist(&mut pm, false);
        let snap2 = pm.page_info(0);
        assert_eq!(snap1, snap2);
    }

    #[test]
    fn test_max_subset() {
        // exact fit wins
        assert_eq!(max_subset(&[2000, 2084, 100], 4084), vec![0, 1]);
        // fill as much as possible without exceeding the budget
        assert_eq!(max_subset(&[3000, 3000, 1000], 4084), vec![0, 2]);
        // a single oversized block is skipped
        assert_eq!(max_subset(&[5000], 4084), Vec::<usize>::new());
        // everything fits
        assert_eq!(max_subset(&[100, 200, 300], 4084), vec![0, 1, 2]);

        // two of four equal blocks fill the page best
        let picked = max_subset(&[1500, 1500, 1500, 1500], 4084);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn test_compaction_merges_partial_pages() {
        let dir = TempDir::new().unwrap();
        let range = TimeRange::new(0, 1_000_000);
        let o = opts(256, 4096, 1);
        let path = dir.path().join("compact.dat");
        let mut pm = PageManager::open(path.clone(), range, 0, &o).unwrap();

        // three small partial pages
        let mut expected = Vec::new();
        for p in 0..3u64 {
            let mut view = pm.get_free_page_on_disk(false).unwrap();
            for i in 0..20u64 {
                let ts = p * 10_000 + i * 10;
                let value = (p * 100 + i) as f64;
                assert!(view.add_data_point(&mut pm, ts, value));
                expected.push((ts, value));
            }
            view.persist(&mut pm, false);
        }

        let before = pm.total_size();
        assert!(pm.compact().unwrap());
        assert!(pm.total_size() < before);
        assert_eq!(pm.actual_page_count(), pm.first_info_index() + 1);

        // every sample survives the repack
        let mut all = DataPointVector::new();
        for h in 0..pm.header_index() {
            let info = pm.page_info(h);
            if info.is_empty() {
                continue;
            }
            let mut view = pm.get_the_page_on_disk(h).unwrap();
            view.ensure_dp_available(&pm, Some(&mut all)).unwrap();
        }
        assert_eq!(all.len(), expected.len());
        let mut got: Vec<_> = all.iter().map(|dp| (dp.timestamp, dp.value)).collect();
        got.sort_by_key(|(ts, _)| *ts);
        expected.sort_by_key(|(ts, _)| *ts);
        assert_eq!(got, expected);

        // headers still satisfy the packing invariant
        for h in 0..pm.header_index() {
            let info = pm.page_info(h);
            assert!(info.offset as u32 + info.size as u32 <= pm.page_size());
        }

        // compacted files reopen cleanly
        drop(pm);
        let pm = PageManager::open(path, range, 0, &o).unwrap();
        assert!(pm.is_compacted());
    }

    #[test]
    fn test_compaction_tail_reuse_allocation() {
        let dir = TempDir::new().unwrap();
        let range = TimeRange::new(0, 1_000_000);
        let o = opts(256, 4096, 1);
        let mut pm = open(&dir, "tail.dat", range, &o);

        // first page: write a little, then clamp its header size
        let mut view = pm.get_free_page_on_disk(false).unwrap();
        for i in 0..10u64 {
            assert!(view.add_data_point(&mut pm, i * 10, i as f64));
        }
        view.shrink_to_fit(&mut pm);
        let first_info = pm.page_info(0);
        assert!(first_info.full);
        assert!((first_info.size as u32) < pm.page_size());

        // the compaction allocator reuses the tail of the same page
        let next = pm.get_free_page_for_compaction().unwrap();
        let next_info = pm.page_info(next.header_index());
        assert_eq!(next_info.page_index, first_info.page_index);
        assert_eq!(next_info.offset, first_info.offset + first_info.size);
    }
}
