//! Core types for EmberDB

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp in native resolution (seconds or milliseconds, fixed per file)
pub type Timestamp = u64;

/// Sentinel for "no timestamp yet"
pub const INVALID_TIMESTAMP: Timestamp = u64::MAX;

/// Opaque series identifier assigned by the external indexer
pub type TimeSeriesId = u32;

/// Opaque metric identifier assigned by the external indexer
pub type MetricId = u32;

/// Convert a native-resolution timestamp to seconds
#[inline]
pub fn to_sec(ts: Timestamp, ms_resolution: bool) -> Timestamp {
    if ms_resolution {
        ts / 1000
    } else {
        ts
    }
}

/// A single sample: timestamp plus value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Timestamp in native resolution
    pub timestamp: Timestamp,
    /// Sample value
    pub value: f64,
}

impl DataPoint {
    /// Create a new data point
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Growable sample vector used by decode paths
pub type DataPointVector = Vec<DataPoint>;

/// Closed-open time interval `[from, to)` in native resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub from: Timestamp,
    /// End timestamp (exclusive)
    pub to: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(from: Timestamp, to: Timestamp) -> Self {
        Self { from, to }
    }

    /// An inverted range that becomes valid once `add_time` is called
    pub fn empty() -> Self {
        Self {
            from: Timestamp::MAX,
            to: 0,
        }
    }

    /// True until `add_time` has recorded at least one timestamp
    pub fn is_empty(&self) -> bool {
        self.from > self.to
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.from <= ts && ts < self.to
    }

    /// Check if `other` lies entirely within this range
    pub fn contains_range(&self, other: &TimeRange) -> bool {
        other.is_empty() || (self.from <= other.from && other.to <= self.to)
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.from < other.to && other.from < self.to
    }

    /// Extend the range to include `ts`
    pub fn add_time(&mut self, ts: Timestamp) {
        self.from = self.from.min(ts);
        self.to = self.to.max(ts);
    }

    /// Grow this range to cover `other`
    pub fn merge(&mut self, other: &TimeRange) {
        self.from = self.from.min(other.from);
        self.to = self.to.max(other.to);
    }

    /// Clip this range to its intersection with `other`
    pub fn intersect(&mut self, other: &TimeRange) {
        self.from = self.from.max(other.from);
        self.to = self.to.min(other.to);
    }

    /// Duration in native resolution
    pub fn duration(&self) -> Timestamp {
        self.to.saturating_sub(self.from)
    }

    /// Start of the range in seconds
    pub fn from_sec(&self, ms_resolution: bool) -> Timestamp {
        to_sec(self.from, ms_resolution)
    }

    /// End of the range in seconds
    pub fn to_sec(&self, ms_resolution: bool) -> Timestamp {
        to_sec(self.to, ms_resolution)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

/// Time units recognized by config `time` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Ms,
    Sec,
    Min,
    Hour,
    Day,
}

impl TimeUnit {
    /// Milliseconds per unit
    pub fn as_ms(&self) -> u64 {
        match self {
            TimeUnit::Ms => 1,
            TimeUnit::Sec => 1_000,
            TimeUnit::Min => 60_000,
            TimeUnit::Hour => 3_600_000,
            TimeUnit::Day => 86_400_000,
        }
    }

    /// Parse a unit suffix ("ms", "s", "m", "h", "d")
    pub fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "ms" => Some(TimeUnit::Ms),
            "s" | "sec" => Some(TimeUnit::Sec),
            "m" | "min" => Some(TimeUnit::Min),
            "h" | "hour" => Some(TimeUnit::Hour),
            "d" | "day" => Some(TimeUnit::Day),
            _ => None,
        }
    }
}
