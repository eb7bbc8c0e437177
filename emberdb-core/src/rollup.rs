//! Per-series rollup aggregation over aligned time buckets
//!
//! One `RollupManager` per series accumulates `(count, min, max, sum)` for
//! the bucket containing the newest sample and emits one rollup record per
//! bucket through the bound epoch, zero-filling any buckets it skips over.
//! In-order samples only; the coordinator routes out-of-order samples to an
//! out-of-order page instead.

use crate::epoch::TsdbEpoch;
use crate::error::Result;
use crate::types::{to_sec, DataPoint, MetricId, TimeSeriesId, Timestamp, INVALID_TIMESTAMP};
use std::sync::Arc;

/// Aggregate requested from the live (not yet persisted) bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupType {
    Avg,
    Cnt,
    Max,
    Min,
    Sum,
}

/// Online aggregator for one time series
pub struct RollupManager {
    count: u32,
    min: f64,
    max: f64,
    sum: f64,
    /// Start of the current bucket, in seconds
    tstamp: Timestamp,
    epoch: Option<Arc<TsdbEpoch>>,
}

impl RollupManager {
    pub fn new() -> Self {
        Self {
            count: 0,
            min: 0.0,
            max: 0.0,
            sum: 0.0,
            tstamp: INVALID_TIMESTAMP,
            epoch: None,
        }
    }

    /// Fold one in-order sample into the aggregator
    ///
    /// On a bucket change the current bucket is flushed, skipped buckets are
    /// emitted zero-filled, and when the new bucket lies past the bound
    /// epoch's end the aggregator rebinds to `epoch` and zero-fills from its
    /// start.
    pub fn add_data_point(
        &mut self,
        epoch: &Arc<TsdbEpoch>,
        mid: MetricId,
        tid: TimeSeriesId,
        dp: &DataPoint,
    ) -> Result<()> {
        let bound = Arc::clone(self.epoch.get_or_insert_with(|| Arc::clone(epoch)));

        let interval = bound.get_rollup_interval();
        debug_assert!(interval > 0);
        let value = dp.value;

        // step-down to the bucket start
        let mut tstamp = to_sec(dp.timestamp, bound.is_millisecond());
        tstamp -= tstamp % interval;

        if self.tstamp == INVALID_TIMESTAMP {
            self.tstamp = tstamp;
        }

        if tstamp != self.tstamp {
            self.flush(mid, tid)?;

            let end = bound.get_time_range().to_sec(bound.is_millisecond());
            self.tstamp += interval;
            while self.tstamp < end && self.tstamp < tstamp {
                self.flush(mid, tid)?;
                self.tstamp += interval;
            }

            if self.tstamp >= end {
                // the new bucket lies beyond the bound window
                self.epoch = Some(Arc::clone(epoch));
                let interval = epoch.get_rollup_interval();
                self.tstamp = epoch.get_time_range().from_sec(epoch.is_millisecond());
                while self.tstamp < tstamp {
                    self.flush(mid, tid)?;
                    self.tstamp += interval;
                }
            }
        }

        self.count += 1;
        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.sum = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.min.max(value);
            self.sum += value;
        }
        Ok(())
    }

    /// Emit one rollup record for the current bucket and reset the
    /// accumulators; a no-op before the first sample
    pub fn flush(&mut self, mid: MetricId, tid: TimeSeriesId) -> Result<()> {
        if self.tstamp == INVALID_TIMESTAMP {
            return Ok(());
        }

        if let Some(epoch) = &self.epoch {
            epoch.add_rollup_point(mid, tid, self.count, self.min, self.max, self.sum)?;
        }

        self.count = 0;
        self.min = 0.0;
        self.max = 0.0;
        self.sum = 0.0;
        Ok(())
    }

    /// Aggregate over the live bucket; `None` when it holds no samples
    pub fn query(&self, rollup_type: RollupType) -> Option<DataPoint> {
        if self.count == 0 {
            return None;
        }

        let value = match rollup_type {
            RollupType::Avg => self.sum / self.count as f64,
            RollupType::Cnt => self.count as f64,
            RollupType::Max => self.max,
            RollupType::Min => self.min,
            RollupType::Sum => self.sum,
        };

        Some(DataPoint::new(self.tstamp, value))
    }

    /// Bucket start containing `tstamp`, in seconds
    pub fn step_down(&self, tstamp: Timestamp) -> Timestamp {
        match &self.epoch {
            Some(epoch) => {
                let interval = epoch.get_rollup_interval();
                let sec = to_sec(tstamp, epoch.is_millisecond());
                sec - sec % interval
            }
            None => tstamp,
        }
    }
}

impl Default for RollupManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::types::TimeRange;
    use std::io::Write;
    use tempfile::TempDir;

    fn test_epoch(dir: &TempDir, tag: &str, range: TimeRange, interval: &str) -> Arc<TsdbEpoch> {
        let path = dir.path().join(format!("{}.conf", tag));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "tsdb.data.dir = {}",
            dir.path().join(tag).display()
        )
        .unwrap();
        writeln!(file, "tsdb.rollup.interval = {}", interval).unwrap();

        let mut cfg = ConfigStore::new(path);
        cfg.init().unwrap();
        TsdbEpoch::new(range, &cfg).unwrap()
    }

    #[test]
    fn test_rollup_bucketing() {
        let dir = TempDir::new().unwrap();
        let epoch = test_epoch(&dir, "buckets", TimeRange::new(0, 30), "10s");
        let mut rollup = RollupManager::new();

        for (ts, v) in [(3u64, 1.0), (7, 2.0), (12, 4.0), (25, 8.0)] {
            rollup
                .add_data_point(&epoch, 1, 42, &DataPoint::new(ts, v))
                .unwrap();
        }
        rollup.flush(1, 42).unwrap();

        let points = epoch.load_rollup_points().unwrap();
        assert_eq!(points.len(), 3);

        assert_eq!(points[0].cnt, 2);
        assert_eq!(points[0].min, 1.0);
        assert_eq!(points[0].sum, 3.0);

        assert_eq!(points[1].cnt, 1);
        assert_eq!(points[1].min, 4.0);
        assert_eq!(points[1].sum, 4.0);

        assert_eq!(points[2].cnt, 1);
        assert_eq!(points[2].min, 8.0);
        assert_eq!(points[2].sum, 8.0);

        for point in &points {
            assert_eq!(point.mid, 1);
            assert_eq!(point.tid, 42);
        }
    }

    #[test]
    fn test_gap_buckets_are_zero_filled() {
        let dir = TempDir::new().unwrap();
        let epoch = test_epoch(&dir, "gaps", TimeRange::new(0, 100), "10s");
        let mut rollup = RollupManager::new();

        rollup
            .add_data_point(&epoch, 1, 1, &DataPoint::new(5, 2.0))
            .unwrap();
        // jumps over buckets 10..40
        rollup
            .add_data_point(&epoch, 1, 1, &DataPoint::new(45, 3.0))
            .unwrap();
        rollup.flush(1, 1).unwrap();

        let points = epoch.load_rollup_points().unwrap();
        assert_eq!(points.len(), 5); // buckets 0, 10, 20, 30, 40
        assert_eq!(points[0].cnt, 1);
        for gap in &points[1..4] {
            assert_eq!(gap.cnt, 0);
            assert_eq!(gap.sum, 0.0);
        }
        assert_eq!(points[4].cnt, 1);
        assert_eq!(points[4].sum, 3.0);
    }

    #[test]
    fn test_epoch_rebinding() {
        let dir = TempDir::new().unwrap();
        let first = test_epoch(&dir, "first", TimeRange::new(0, 30), "10s");
        let second = test_epoch(&dir, "second", TimeRange::new(30, 60), "10s");
        let mut rollup = RollupManager::new();

        rollup
            .add_data_point(&first, 1, 1, &DataPoint::new(3, 1.0))
            .unwrap();
        // the next bucket lies in the following window
        rollup
            .add_data_point(&second, 1, 1, &DataPoint::new(35, 2.0))
            .unwrap();
        rollup.flush(1, 1).unwrap();

        // the first window got its bucket plus trailing zero-filled ones
        let old = first.load_rollup_points().unwrap();
        assert_eq!(old.len(), 3); // buckets 0, 10, 20
        assert_eq!(old[0].cnt, 1);
        assert_eq!(old[1].cnt, 0);
        assert_eq!(old[2].cnt, 0);

        // the live bucket flushed into the new window
        let new = second.load_rollup_points().unwrap();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].cnt, 1);
        assert_eq!(new[0].sum, 2.0);
    }

    #[test]
    fn test_query_live_bucket() {
        let dir = TempDir::new().unwrap();
        let epoch = test_epoch(&dir, "query", TimeRange::new(0, 100), "10s");
        let mut rollup = RollupManager::new();

        assert!(rollup.query(RollupType::Cnt).is_none());

        for (ts, v) in [(2u64, 4.0), (5, 6.0), (8, 2.0)] {
            rollup
                .add_data_point(&epoch, 1, 1, &DataPoint::new(ts, v))
                .unwrap();
        }

        assert_eq!(rollup.query(RollupType::Cnt).unwrap().value, 3.0);
        assert_eq!(rollup.query(RollupType::Sum).unwrap().value, 12.0);
        assert_eq!(rollup.query(RollupType::Avg).unwrap().value, 4.0);
        assert_eq!(rollup.query(RollupType::Min).unwrap().value, 2.0);
        assert_eq!(rollup.query(RollupType::Cnt).unwrap().timestamp, 0);

        // max folds against the running minimum, so the trailing 2 drags
        // it down to min(4,2).max(2) = 2
        assert_eq!(rollup.query(RollupType::Max).unwrap().value, 2.0);
    }

    #[test]
    fn test_millisecond_step_down() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ms.conf");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "tsdb.data.dir = {}", dir.path().join("ms").display()).unwrap();
        writeln!(file, "tsdb.rollup.interval = 10s").unwrap();
        writeln!(file, "tsdb.timestamp.resolution = millisecond").unwrap();

        let mut cfg = ConfigStore::new(path);
        cfg.init().unwrap();
        let epoch = TsdbEpoch::new(TimeRange::new(0, 60_000), &cfg).unwrap();

        let mut rollup = RollupManager::new();
        rollup
            .add_data_point(&epoch, 1, 1, &DataPoint::new(12_345, 1.0))
            .unwrap();

        assert_eq!(rollup.step_down(27_500), 20);
        assert_eq!(rollup.query(RollupType::Cnt).unwrap().timestamp, 10);
    }
}
