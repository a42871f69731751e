use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bucket granularity for snapshot queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsGranularity {
    Minute,
    FiveMinute,
    Hour,
    Day,
}

impl AnalyticsGranularity {
    #[must_use]
    pub fn seconds(self) -> i64 {
        match self {
            Self::Minute => 60,
            Self::FiveMinute => 300,
            Self::Hour => 3_600,
            Self::Day => 86_400,
        }
    }

    /// Auto-select by range: `<=24h -> 5-min`, `<=7d -> hour`, else day.
    #[must_use]
    pub fn for_range_seconds(range: i64) -> Self {
        if range <= 86_400 {
            Self::FiveMinute
        } else if range <= 7 * 86_400 {
            Self::Hour
        } else {
            Self::Day
        }
    }
}

/// A metrics snapshot request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<AnalyticsGranularity>,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

fn default_top_n() -> usize {
    10
}

/// One `(name, count)` row in a top-N listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopEntry {
    pub name: String,
    pub count: u64,
}

/// One point in the snapshot time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub start: DateTime<Utc>,
    pub count: u64,
    pub error_count: u64,
    pub avg_ms: f64,
}

/// Aggregated answer for a range query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p75_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub unique_users: u64,
    /// Status code -> count.
    pub status_histogram: BTreeMap<u16, u64>,
    pub top_apis: Vec<TopEntry>,
    pub top_users: Vec<TopEntry>,
    pub granularity: AnalyticsGranularity,
    pub series: Vec<SeriesPoint>,
}
