//! Per-host traffic statistics: live accumulation and the persisted record
//! shapes.

mod accumulator;
mod models;

pub use accumulator::{StatsAccumulator, FLUSH_PERIOD};
pub use models::{metric_points, HostStats, MetricPoint};
