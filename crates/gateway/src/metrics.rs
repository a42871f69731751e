//! In-memory time-bucketed request metrics.
//!
//! Every gateway request lands in the current 1-minute bucket in O(1).
//! A background task rolls completed minutes into 5-minute, hourly, and
//! daily bands; each band has its own retention. Latency percentiles come
//! from a bounded per-bucket sample ring.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use doorman_core::{AnalyticsGranularity, AnalyticsQuery, AnalyticsSnapshot, SeriesPoint, TopEntry};

/// Default bound on latency samples kept per bucket; overridable via
/// `METRICS_PCT_SAMPLES`.
pub const DEFAULT_RESERVOIR_SIZE: usize = 500;

/// Retention per band, in bucket counts.
const MINUTE_RETENTION: usize = 24 * 60;
const FIVE_MINUTE_RETENTION: usize = 7 * 24 * 12;
const HOURLY_RETENTION: usize = 30 * 24;
const DAILY_RETENTION: usize = 90;

/// One gateway request, as seen by the metrics plane.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub status: u16,
    pub duration_ms: f64,
    /// `anonymous` when the caller could not be identified.
    pub username: String,
    /// `{type}:{name}`, e.g. `rest:customers`.
    pub api_key: String,
    pub endpoint_uri: String,
    pub method: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Per-endpoint counters inside a bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointCounters {
    pub count: u64,
    pub error_count: u64,
    pub total_ms: f64,
}

/// One time bucket. The same shape backs every band; only the width and
/// retention differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub start_ts: i64,
    pub count: u64,
    pub error_count: u64,
    pub total_ms: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Bounded latency sample ring (milliseconds).
    pub latency_samples: Vec<f64>,
    /// Write cursor for the ring once it is full.
    #[serde(default)]
    sample_cursor: usize,
    pub status_histogram: BTreeMap<u16, u64>,
    pub api_histogram: HashMap<String, u64>,
    pub user_histogram: HashMap<String, u64>,
    pub endpoints: HashMap<String, EndpointCounters>,
    pub unique_users: HashSet<String>,
    pub retries: u64,
    pub upstream_timeouts: u64,
}

impl Bucket {
    fn new(start_ts: i64) -> Self {
        Self {
            start_ts,
            count: 0,
            error_count: 0,
            total_ms: 0.0,
            bytes_in: 0,
            bytes_out: 0,
            latency_samples: Vec::new(),
            sample_cursor: 0,
            status_histogram: BTreeMap::new(),
            api_histogram: HashMap::new(),
            user_histogram: HashMap::new(),
            endpoints: HashMap::new(),
            unique_users: HashSet::new(),
            retries: 0,
            upstream_timeouts: 0,
        }
    }

    fn push_sample(&mut self, ms: f64, cap: usize) {
        if self.latency_samples.len() < cap {
            self.latency_samples.push(ms);
        } else if cap > 0 {
            // Overwrite in ring order so late samples still land.
            self.latency_samples[self.sample_cursor % cap] = ms;
            self.sample_cursor = (self.sample_cursor + 1) % cap;
        }
    }

    fn add(&mut self, record: &RequestRecord, cap: usize) {
        self.count += 1;
        if record.status >= 400 {
            self.error_count += 1;
        }
        self.total_ms += record.duration_ms;
        self.bytes_in += record.bytes_in;
        self.bytes_out += record.bytes_out;
        self.push_sample(record.duration_ms, cap);
        *self.status_histogram.entry(record.status).or_default() += 1;
        *self.api_histogram.entry(record.api_key.clone()).or_default() += 1;
        *self
            .user_histogram
            .entry(record.username.clone())
            .or_default() += 1;
        let ep = self
            .endpoints
            .entry(format!("{} {}", record.method, record.endpoint_uri))
            .or_default();
        ep.count += 1;
        if record.status >= 400 {
            ep.error_count += 1;
        }
        ep.total_ms += record.duration_ms;
        self.unique_users.insert(record.username.clone());
    }

    /// Merge `other` into `self` (used by rollups and range queries).
    fn merge(&mut self, other: &Bucket, cap: usize) {
        self.count += other.count;
        self.error_count += other.error_count;
        self.total_ms += other.total_ms;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        for sample in &other.latency_samples {
            self.push_sample(*sample, cap);
        }
        for (status, n) in &other.status_histogram {
            *self.status_histogram.entry(*status).or_default() += n;
        }
        for (api, n) in &other.api_histogram {
            *self.api_histogram.entry(api.clone()).or_default() += n;
        }
        for (user, n) in &other.user_histogram {
            *self.user_histogram.entry(user.clone()).or_default() += n;
        }
        for (ep, counters) in &other.endpoints {
            let entry = self.endpoints.entry(ep.clone()).or_default();
            entry.count += counters.count;
            entry.error_count += counters.error_count;
            entry.total_ms += counters.total_ms;
        }
        self.unique_users.extend(other.unique_users.iter().cloned());
        self.retries += other.retries;
        self.upstream_timeouts += other.upstream_timeouts;
    }
}

/// The full ring state, serializable for the shutdown snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Bands {
    minutes: BTreeMap<i64, Bucket>,
    five_minutes: BTreeMap<i64, Bucket>,
    hourly: BTreeMap<i64, Bucket>,
    daily: BTreeMap<i64, Bucket>,
}

impl Bands {
    fn band(&self, granularity: AnalyticsGranularity) -> &BTreeMap<i64, Bucket> {
        match granularity {
            AnalyticsGranularity::Minute => &self.minutes,
            AnalyticsGranularity::FiveMinute => &self.five_minutes,
            AnalyticsGranularity::Hour => &self.hourly,
            AnalyticsGranularity::Day => &self.daily,
        }
    }
}

/// Thread-safe metrics store shared by every request task.
pub struct MetricsStore {
    inner: Mutex<Bands>,
    reservoir_size: usize,
}

impl std::fmt::Debug for MetricsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsStore")
            .field("reservoir_size", &self.reservoir_size)
            .finish_non_exhaustive()
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(DEFAULT_RESERVOIR_SIZE)
    }
}

fn floor_to(ts: i64, width: i64) -> i64 {
    ts - ts.rem_euclid(width)
}

impl MetricsStore {
    #[must_use]
    pub fn new(reservoir_size: usize) -> Self {
        Self {
            inner: Mutex::new(Bands::default()),
            reservoir_size: reservoir_size.max(1),
        }
    }

    /// Record one request into the current minute bucket.
    pub fn record(&self, record: &RequestRecord) {
        self.record_at(Utc::now().timestamp(), record);
    }

    /// Record at an explicit timestamp (tests and replay).
    pub fn record_at(&self, ts: i64, record: &RequestRecord) {
        let start = floor_to(ts, 60);
        let mut bands = self.inner.lock();
        bands
            .minutes
            .entry(start)
            .or_insert_with(|| Bucket::new(start))
            .add(record, self.reservoir_size);
        Self::prune(&mut bands.minutes, MINUTE_RETENTION);
    }

    /// Count a retry attempt against the current minute.
    pub fn record_retry(&self) {
        let start = floor_to(Utc::now().timestamp(), 60);
        let mut bands = self.inner.lock();
        bands
            .minutes
            .entry(start)
            .or_insert_with(|| Bucket::new(start))
            .retries += 1;
    }

    /// Count an upstream timeout against the current minute.
    pub fn record_upstream_timeout(&self) {
        let start = floor_to(Utc::now().timestamp(), 60);
        let mut bands = self.inner.lock();
        bands
            .minutes
            .entry(start)
            .or_insert_with(|| Bucket::new(start))
            .upstream_timeouts += 1;
    }

    fn prune(band: &mut BTreeMap<i64, Bucket>, retention: usize) {
        while band.len() > retention {
            let Some((&oldest, _)) = band.iter().next() else {
                break;
            };
            band.remove(&oldest);
        }
    }

    /// Roll completed source buckets up into the wider band.
    fn roll_band(
        source: &BTreeMap<i64, Bucket>,
        target: &mut BTreeMap<i64, Bucket>,
        width: i64,
        now: i64,
        cap: usize,
    ) {
        let open_window = floor_to(now, width);
        // Rebuild every closed window that still has source buckets. This
        // keeps the rollup idempotent without per-bucket bookkeeping.
        let mut windows: Vec<i64> = source
            .keys()
            .map(|start| floor_to(*start, width))
            .filter(|w| *w < open_window)
            .collect();
        windows.dedup();
        for window in windows {
            let mut rebuilt = Bucket::new(window);
            for (_, bucket) in source.range(window..window + width) {
                rebuilt.merge(bucket, cap);
            }
            target.insert(window, rebuilt);
        }
    }

    /// Run one rollup pass at `now`, pruning each band to its retention.
    pub fn rollup_at(&self, now: i64) {
        let mut bands = self.inner.lock();
        let cap = self.reservoir_size;

        let minutes = bands.minutes.clone();
        Self::roll_band(&minutes, &mut bands.five_minutes, 300, now, cap);
        let five = bands.five_minutes.clone();
        Self::roll_band(&five, &mut bands.hourly, 3_600, now, cap);
        let hourly = bands.hourly.clone();
        Self::roll_band(&hourly, &mut bands.daily, 86_400, now, cap);

        Self::prune(&mut bands.minutes, MINUTE_RETENTION);
        Self::prune(&mut bands.five_minutes, FIVE_MINUTE_RETENTION);
        Self::prune(&mut bands.hourly, HOURLY_RETENTION);
        Self::prune(&mut bands.daily, DAILY_RETENTION);
    }

    /// Run one rollup pass at the current time. Driven by the 5-minute
    /// background task.
    pub fn rollup(&self) {
        self.rollup_at(Utc::now().timestamp());
    }

    /// Answer a range query.
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self, query: &AnalyticsQuery) -> AnalyticsSnapshot {
        let range = (query.end - query.start).num_seconds().max(0);
        let granularity = query
            .granularity
            .unwrap_or_else(|| AnalyticsGranularity::for_range_seconds(range));

        let bands = self.inner.lock();
        // The 5-minute band only holds closed windows; fall through to the
        // minute band for ranges the rollup has not covered yet.
        let band = if granularity == AnalyticsGranularity::FiveMinute
            && bands.five_minutes.is_empty()
        {
            bands.band(AnalyticsGranularity::Minute)
        } else {
            bands.band(granularity)
        };

        let start_ts = query.start.timestamp();
        let end_ts = query.end.timestamp();

        let mut merged = Bucket::new(start_ts);
        let mut series = Vec::new();
        for (bucket_start, bucket) in band.range(start_ts..=end_ts) {
            merged.merge(bucket, self.reservoir_size * 4);
            series.push(SeriesPoint {
                start: ts_to_datetime(*bucket_start),
                count: bucket.count,
                error_count: bucket.error_count,
                avg_ms: if bucket.count > 0 {
                    bucket.total_ms / bucket.count as f64
                } else {
                    0.0
                },
            });
        }

        let mut samples = merged.latency_samples.clone();
        samples.sort_by(f64::total_cmp);

        AnalyticsSnapshot {
            total_requests: merged.count,
            total_errors: merged.error_count,
            avg_ms: if merged.count > 0 {
                merged.total_ms / merged.count as f64
            } else {
                0.0
            },
            p50_ms: percentile(&samples, 50.0),
            p75_ms: percentile(&samples, 75.0),
            p90_ms: percentile(&samples, 90.0),
            p95_ms: percentile(&samples, 95.0),
            p99_ms: percentile(&samples, 99.0),
            bytes_in: merged.bytes_in,
            bytes_out: merged.bytes_out,
            unique_users: merged.unique_users.len() as u64,
            status_histogram: merged.status_histogram.clone(),
            top_apis: top_n(&merged.api_histogram, query.top_n),
            top_users: top_n(&merged.user_histogram, query.top_n),
            granularity,
            series,
        }
    }

    /// Serialize the full ring for the shutdown snapshot.
    pub fn dump(&self) -> serde_json::Value {
        let bands = self.inner.lock();
        serde_json::to_value(&*bands).unwrap_or(serde_json::Value::Null)
    }

    /// Restore ring state written by [`dump`](Self::dump). Invalid payloads
    /// are ignored — metrics are not worth refusing startup over.
    pub fn restore(&self, value: &serde_json::Value) {
        if let Ok(restored) = serde_json::from_value::<Bands>(value.clone()) {
            *self.inner.lock() = restored;
        }
    }
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

fn top_n(histogram: &HashMap<String, u64>, n: usize) -> Vec<TopEntry> {
    let mut entries: Vec<TopEntry> = histogram
        .iter()
        .map(|(name, count)| TopEntry {
            name: name.clone(),
            count: *count,
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    entries.truncate(n);
    entries
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((pct / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(status: u16, user: &str, api: &str, ms: f64) -> RequestRecord {
        RequestRecord {
            status,
            duration_ms: ms,
            username: user.to_owned(),
            api_key: api.to_owned(),
            endpoint_uri: "/ping".to_owned(),
            method: "GET".to_owned(),
            bytes_in: 100,
            bytes_out: 250,
        }
    }

    fn query_around(ts: i64, granularity: AnalyticsGranularity) -> AnalyticsQuery {
        AnalyticsQuery {
            start: ts_to_datetime(ts - 3_600),
            end: ts_to_datetime(ts + 3_600),
            granularity: Some(granularity),
            top_n: 10,
        }
    }

    #[test]
    fn record_and_snapshot_basics() {
        let store = MetricsStore::default();
        let ts = 1_700_000_000;
        store.record_at(ts, &record(200, "alice", "rest:echo", 10.0));
        store.record_at(ts, &record(200, "bob", "rest:echo", 30.0));
        store.record_at(ts, &record(500, "alice", "rest:pay", 50.0));

        let snap = store.snapshot(&query_around(ts, AnalyticsGranularity::Minute));
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.total_errors, 1);
        assert_eq!(snap.unique_users, 2);
        assert_eq!(snap.bytes_in, 300);
        assert_eq!(snap.status_histogram.get(&200), Some(&2));
        assert_eq!(snap.top_apis[0].name, "rest:echo");
        assert!((snap.avg_ms - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn percentiles_from_reservoir() {
        let store = MetricsStore::default();
        let ts = 1_700_000_000;
        for i in 1..=100 {
            store.record_at(ts, &record(200, "u", "rest:echo", f64::from(i)));
        }
        let snap = store.snapshot(&query_around(ts, AnalyticsGranularity::Minute));
        assert!((snap.p50_ms - 50.0).abs() <= 2.0);
        assert!((snap.p95_ms - 95.0).abs() <= 2.0);
        assert!((snap.p99_ms - 99.0).abs() <= 2.0);
    }

    #[test]
    fn reservoir_is_bounded() {
        let store = MetricsStore::new(10);
        let ts = 1_700_000_000;
        for i in 0..100 {
            store.record_at(ts, &record(200, "u", "a", f64::from(i)));
        }
        let snap = store.snapshot(&query_around(ts, AnalyticsGranularity::Minute));
        assert_eq!(snap.total_requests, 100);
        // Percentiles still computable from the bounded ring.
        assert!(snap.p50_ms >= 0.0);
    }

    #[test]
    fn rollup_builds_five_minute_band() {
        let store = MetricsStore::default();
        let base = floor_to(1_700_000_000, 300);
        // Three minutes inside one closed 5-minute window.
        for minute in 0..3 {
            store.record_at(base + minute * 60, &record(200, "alice", "rest:echo", 10.0));
        }
        // Rollup with "now" two windows later so the window is closed.
        store.rollup_at(base + 700);

        let snap = store.snapshot(&AnalyticsQuery {
            start: ts_to_datetime(base - 60),
            end: ts_to_datetime(base + 400),
            granularity: Some(AnalyticsGranularity::FiveMinute),
            top_n: 5,
        });
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.series.len(), 1, "one 5-minute bucket");
    }

    #[test]
    fn rollup_is_idempotent() {
        let store = MetricsStore::default();
        let base = floor_to(1_700_000_000, 300);
        store.record_at(base, &record(200, "alice", "rest:echo", 10.0));
        store.rollup_at(base + 600);
        store.rollup_at(base + 900);
        store.rollup_at(base + 1_200);

        let snap = store.snapshot(&AnalyticsQuery {
            start: ts_to_datetime(base - 60),
            end: ts_to_datetime(base + 301),
            granularity: Some(AnalyticsGranularity::FiveMinute),
            top_n: 5,
        });
        assert_eq!(snap.total_requests, 1, "repeat rollups must not double-count");
    }

    #[test]
    fn dump_restore_roundtrip() {
        let store = MetricsStore::default();
        let ts = 1_700_000_000;
        store.record_at(ts, &record(200, "alice", "rest:echo", 12.5));
        let dumped = store.dump();

        let restored = MetricsStore::default();
        restored.restore(&dumped);
        let snap = restored.snapshot(&query_around(ts, AnalyticsGranularity::Minute));
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.top_users[0].name, "alice");
    }

    #[test]
    fn granularity_defaults_by_range() {
        let store = MetricsStore::default();
        let now = Utc::now();
        let q = AnalyticsQuery {
            start: now - Duration::days(10),
            end: now,
            granularity: None,
            top_n: 5,
        };
        let snap = store.snapshot(&q);
        assert_eq!(snap.granularity, AnalyticsGranularity::Day);
    }
}
