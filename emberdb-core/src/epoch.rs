//! Tsdb epoch coordinator
//!
//! A `TsdbEpoch` binds one time window to its on-disk state: one or more
//! page-manager data files (a new file is opened whenever the current one
//! runs out of slots) and one append-only rollup record file. The external
//! series index holds `EpochPage` handles and routes samples through them.

use crate::config::{self, ConfigStore};
use crate::error::Result;
use crate::storage::{PageManager, PageManagerOptions, PageView, DEFAULT_PAGE_SIZE};
use crate::types::{DataPointVector, MetricId, TimeRange, TimeSeriesId, Timestamp, TimeUnit};
use bytes::{Buf, BufMut};
use parking_lot::{Mutex, RwLock};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One pre-aggregated bucket for one series, as stored in the rollup file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollupPoint {
    pub mid: MetricId,
    pub tid: TimeSeriesId,
    pub cnt: u32,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
}

impl RollupPoint {
    /// Encoded size in bytes
    pub const SIZE: usize = 36;

    fn write_to(&self, dest: &mut [u8]) {
        let mut buf = &mut dest[..Self::SIZE];
        buf.put_u32_le(self.mid);
        buf.put_u32_le(self.tid);
        buf.put_u32_le(self.cnt);
        buf.put_f64_le(self.min);
        buf.put_f64_le(self.max);
        buf.put_f64_le(self.sum);
    }

    fn read_from(src: &[u8]) -> Self {
        let mut buf = &src[..Self::SIZE];
        Self {
            mid: buf.get_u32_le(),
            tid: buf.get_u32_le(),
            cnt: buf.get_u32_le(),
            min: buf.get_f64_le(),
            max: buf.get_f64_le(),
            sum: buf.get_f64_le(),
        }
    }
}

/// Coordinator for one `[from, to)` window
pub struct TsdbEpoch {
    time_range: TimeRange,
    data_dir: PathBuf,
    rollup_interval: Timestamp,
    millisecond: bool,
    compact_enabled: bool,
    mgr_opts: PageManagerOptions,
    managers: RwLock<Vec<Arc<Mutex<PageManager>>>>,
    rollup_file: PathBuf,
    rollup: Mutex<BufWriter<std::fs::File>>,
    accepting: AtomicBool,
}

impl TsdbEpoch {
    /// Open an epoch for `range` using the supplied configuration
    pub fn new(range: TimeRange, cfg: &ConfigStore) -> Result<Arc<Self>> {
        debug_assert!(range.from < range.to);

        let data_dir = cfg.data_dir();
        std::fs::create_dir_all(&data_dir)?;

        let mgr_opts = PageManagerOptions {
            page_count: cfg.get_int_or(config::CFG_TSDB_PAGE_COUNT, config::CFG_TSDB_PAGE_COUNT_DEF)
                as u32,
            page_size: DEFAULT_PAGE_SIZE,
            compressor_version: cfg.get_int_or(
                config::CFG_TSDB_COMPRESSOR_VERSION,
                config::CFG_TSDB_COMPRESSOR_VERSION_DEF,
            ) as u8,
            millisecond: cfg.is_millisecond(),
        };

        let rollup_interval = cfg.get_time_or(
            config::CFG_TSDB_ROLLUP_INTERVAL,
            TimeUnit::Sec,
            config::CFG_TSDB_ROLLUP_INTERVAL_DEF,
        )?;

        let rollup_file = data_dir.join(format!("{}.{}.rollup", range.from, range.to));
        let rollup = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&rollup_file)?;

        info!("opened epoch {}", range);

        Ok(Arc::new(Self {
            time_range: range,
            data_dir,
            rollup_interval,
            millisecond: cfg.is_millisecond(),
            compact_enabled: cfg.get_bool_or(config::CFG_TSDB_COMPACT_ENABLED, false),
            mgr_opts,
            managers: RwLock::new(Vec::new()),
            rollup_file,
            rollup: Mutex::new(BufWriter::new(rollup)),
            accepting: AtomicBool::new(true),
        }))
    }

    /// Data file path for `range`, shard `id`
    pub fn get_file_name(&self, range: TimeRange, id: u32, temp: bool) -> PathBuf {
        let mut name = format!("{}.{}.{}.dat", range.from, range.to, id);
        if temp {
            name.push_str(".temp");
        }
        self.data_dir.join(name)
    }

    pub fn get_time_range(&self) -> TimeRange {
        self.time_range
    }

    /// Rollup bucket width in seconds
    pub fn get_rollup_interval(&self) -> Timestamp {
        self.rollup_interval
    }

    pub fn is_millisecond(&self) -> bool {
        self.millisecond
    }

    /// Allocate a writable page, opening the next data file when the
    /// current one is out of headers or pages
    pub fn get_free_page(&self, ooo: bool) -> Result<Option<EpochPage>> {
        if !self.accepting.load(Ordering::Acquire) {
            return Ok(None);
        }

        let seen = {
            let managers = self.managers.read();
            if let Some(mgr) = managers.last() {
                if let Some(view) = mgr.lock().get_free_page_on_disk(ooo) {
                    return Ok(Some(EpochPage {
                        mgr: Arc::clone(mgr),
                        view,
                    }));
                }
            }
            managers.len()
        };

        let mut managers = self.managers.write();

        // a racing writer may have opened the next file already
        if managers.len() > seen {
            if let Some(mgr) = managers.last() {
                if let Some(view) = mgr.lock().get_free_page_on_disk(ooo) {
                    return Ok(Some(EpochPage {
                        mgr: Arc::clone(mgr),
                        view,
                    }));
                }
            }
        }

        let id = managers.len() as u32;
        let pm = PageManager::open(
            self.get_file_name(self.time_range, id, false),
            self.time_range,
            id,
            &self.mgr_opts,
        )?;
        let mgr = Arc::new(Mutex::new(pm));
        managers.push(Arc::clone(&mgr));

        let view = mgr.lock().get_free_page_on_disk(ooo);
        Ok(view.map(|view| EpochPage { mgr, view }))
    }

    /// Reopen an existing page from data file `file_id`, header slot
    /// `header_idx`
    pub fn get_page(&self, file_id: u32, header_idx: u32) -> Option<EpochPage> {
        let mgr = {
            let managers = self.managers.read();
            Arc::clone(managers.get(file_id as usize)?)
        };
        let view = mgr.lock().get_the_page_on_disk(header_idx)?;
        Some(EpochPage { mgr, view })
    }

    /// Append one rollup record for series `tid` of metric `mid`
    pub fn add_rollup_point(
        &self,
        mid: MetricId,
        tid: TimeSeriesId,
        cnt: u32,
        min: f64,
        max: f64,
        sum: f64,
    ) -> Result<()> {
        let point = RollupPoint {
            mid,
            tid,
            cnt,
            min,
            max,
            sum,
        };
        let mut record = [0u8; RollupPoint::SIZE];
        point.write_to(&mut record);
        self.rollup.lock().write_all(&record)?;
        Ok(())
    }

    /// Read the rollup file back; flushes buffered records first
    pub fn load_rollup_points(&self) -> Result<Vec<RollupPoint>> {
        self.rollup.lock().flush()?;
        let bytes = std::fs::read(&self.rollup_file)?;
        Ok(bytes
            .chunks_exact(RollupPoint::SIZE)
            .map(RollupPoint::read_from)
            .collect())
    }

    /// msync all data files and the rollup file
    pub fn flush(&self, sync: bool) -> Result<()> {
        for mgr in self.managers.read().iter() {
            mgr.lock().flush(sync);
        }

        let mut rollup = self.rollup.lock();
        rollup.flush()?;
        if sync {
            rollup.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Repack all data files; a no-op unless `tsdb.compact.enabled` is set
    pub fn compact(&self) -> Result<bool> {
        if !self.compact_enabled {
            debug!("compaction disabled for epoch {}", self.time_range);
            return Ok(false);
        }

        let mut truncated = false;
        for mgr in self.managers.read().iter() {
            truncated |= mgr.lock().compact()?;
        }
        Ok(truncated)
    }

    /// Cooperative shutdown: stop accepting allocations, shrink every data
    /// file to its used pages, and sync everything out
    pub fn shutdown(&self) -> Result<()> {
        self.accepting.store(false, Ordering::Release);

        for mgr in self.managers.read().iter() {
            let mut pm = mgr.lock();
            pm.shrink_to_fit()?;
            pm.persist();
        }

        let mut rollup = self.rollup.lock();
        rollup.flush()?;
        rollup.get_ref().sync_all()?;

        info!("closed epoch {}", self.time_range);
        Ok(())
    }

    /// Number of data files opened so far
    pub fn file_count(&self) -> usize {
        self.managers.read().len()
    }
}

/// Hot-page handle: one writable (or reopened) page plus its manager
///
/// The external series index holds one of these per hot series. Appends
/// return `false` when the page is full or the timestamp is out of order
/// for the page's encoder; the caller then allocates a replacement page or
/// routes the sample to an out-of-order page.
pub struct EpochPage {
    mgr: Arc<Mutex<PageManager>>,
    view: PageView,
}

impl EpochPage {
    pub fn add_data_point(&mut self, tstamp: Timestamp, value: f64) -> bool {
        let mut pm = self.mgr.lock();
        self.view.add_data_point(&mut pm, tstamp, value)
    }

    pub fn persist(&mut self) {
        let mut pm = self.mgr.lock();
        self.view.persist(&mut pm, false);
    }

    pub fn flush(&mut self) {
        let mut pm = self.mgr.lock();
        self.view.flush(&mut pm);
    }

    pub fn shrink_to_fit(&mut self) {
        let mut pm = self.mgr.lock();
        self.view.shrink_to_fit(&mut pm);
    }

    /// Decode this page's samples into `out`
    pub fn ensure_dp_available(&mut self, out: Option<&mut DataPointVector>) -> Result<()> {
        let pm = self.mgr.lock();
        self.view.ensure_dp_available(&pm, out)
    }

    pub fn is_full(&self) -> bool {
        self.view.is_full(&self.mgr.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.view.is_empty(&self.mgr.lock())
    }

    pub fn is_out_of_order(&self) -> bool {
        self.view.is_out_of_order(&self.mgr.lock())
    }

    pub fn last_tstamp(&self) -> Timestamp {
        self.view.last_tstamp()
    }

    pub fn dp_count(&self) -> usize {
        self.view.dp_count()
    }

    pub fn time_range(&self) -> TimeRange {
        self.view.time_range()
    }

    /// Identifier of the data file this page lives in
    pub fn file_id(&self) -> u32 {
        self.mgr.lock().id()
    }

    pub fn header_index(&self) -> u32 {
        self.view.header_index()
    }
}
