//! EmberDB Core - Time-Series Storage Engine
//!
//! The on-disk storage core of a time-series database, organized around
//! bounded time windows ("epochs"):
//!
//! - **Compressors**: Gorilla delta-of-delta + XOR encoding straight into
//!   mapped page bytes, with an uncompressed fallback for out-of-order data
//! - **Page storage**: one mmap-backed data file per epoch holding
//!   fixed-size pages, allocated under a lock and recovered after torn
//!   writes
//! - **Rollups**: per-series `(count, min, max, sum)` pre-aggregation over
//!   aligned buckets, appended to a per-epoch rollup file
//! - **Configuration**: a reloadable `key=value` store with typed accessors
//!   and an override layer
//!
//! Network front-ends, the series index, and process lifecycle live outside
//! this crate; the [`epoch::TsdbEpoch`] coordinator is the seam they build
//! on.

pub mod compress;
pub mod config;
pub mod epoch;
pub mod rollup;
pub mod storage;

mod error;
mod types;

pub use error::{EmberError, Result};
pub use types::*;

/// EmberDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
