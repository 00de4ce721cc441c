//! Progress tracking and per-category latency metrics.
//!
//! Tracks overall and per-category progress for a known total of jobs.
//! Hot totals (`done`, latency sum/count) are atomics updated on every
//! completion; each category owns a mutex over its latency series so exports
//! read a consistent-per-category snapshot. The snapshot is not globally
//! atomic, which is acceptable for monitoring.
//!
//! Progress and high-latency highlight lines go through the logger's
//! synchronous dual sink so they never lag behind the async queue.
//!
//! # Exports
//!
//! - [`ProgressTracker::export_prometheus`]: text 0.0.4 with cumulative
//!   latency buckets over `{50, 100, 250, 500, 1000, +Inf}` ms per
//!   category, plus global `job_total_done` / `job_total_expected`.
//! - [`ProgressTracker::export_json`]: per-category count/avg/min/max.
//! - [`ProgressTracker::export_summary_json`]: global totals, per-category
//!   summary, and per-category level counts.

use crate::logger::{LogHandle, LogLevel};
use crate::server;
use ahash::AHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// Histogram bucket upper bounds in milliseconds. `+Inf` is implicit.
pub const LATENCY_BUCKETS_MS: [u64; 5] = [50, 100, 250, 500, 1000];

#[inline]
fn level_index(level: LogLevel) -> usize {
    match level {
        LogLevel::Debug => 0,
        LogLevel::Info => 1,
        LogLevel::Warn => 2,
        LogLevel::Error => 3,
    }
}

/// Per-category latency metric.
///
/// `count` is readable without the mutex; the latency series, min/max and
/// level counts are guarded. Invariant: `min <= avg <= max` whenever
/// `count > 0`.
pub struct CategoryMetric {
    count: AtomicU64,
    stats: Mutex<CategoryStats>,
}

struct CategoryStats {
    latencies: Vec<u64>,
    min: u64,
    max: u64,
    level_counts: [u64; 4],
}

impl CategoryMetric {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            stats: Mutex::new(CategoryStats {
                latencies: Vec::new(),
                min: u64::MAX,
                max: 0,
                level_counts: [0; 4],
            }),
        }
    }

    fn record(&self, latency_ms: u64, level: LogLevel) {
        let mut stats = self.stats.lock().expect("category mutex poisoned");
        stats.latencies.push(latency_ms);
        if latency_ms < stats.min {
            stats.min = latency_ms;
        }
        if latency_ms > stats.max {
            stats.max = latency_ms;
        }
        stats.level_counts[level_index(level)] += 1;
        drop(stats);
        self.count.fetch_add(1, Ordering::Release);
    }

    /// Observations recorded so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

/// Concurrent progress tracker with per-category metrics and exports.
pub struct ProgressTracker {
    total: u64,
    done: AtomicU64,
    latency_sum: AtomicU64,
    latency_count: AtomicU64,
    start: Instant,
    paused: AtomicBool,
    log_interval: AtomicU64,
    last_logged: AtomicU64,
    highlight_ms: AtomicU64,
    categories: RwLock<AHashMap<String, Arc<CategoryMetric>>>,
    level_totals: [AtomicU64; 4],
    server_started: AtomicBool,
    log: LogHandle,
}

impl ProgressTracker {
    /// Create a tracker expecting `total` jobs.
    pub fn new(total: u64, log: LogHandle) -> ProgressTracker {
        ProgressTracker {
            total,
            done: AtomicU64::new(0),
            latency_sum: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            start: Instant::now(),
            paused: AtomicBool::new(false),
            log_interval: AtomicU64::new(1),
            last_logged: AtomicU64::new(0),
            highlight_ms: AtomicU64::new(0),
            categories: RwLock::new(AHashMap::new()),
            level_totals: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            server_started: AtomicBool::new(false),
            log,
        }
    }

    /// Expected total.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Jobs marked done so far.
    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Acquire)
    }

    /// Emit a progress line only every `every` completions. Minimum 1.
    pub fn set_log_interval(&self, every: u64) {
        self.log_interval.store(every.max(1), Ordering::Relaxed);
    }

    /// Warn about completions slower than `threshold_ms`. 0 disables.
    pub fn set_highlight_latency(&self, threshold_ms: u64) {
        self.highlight_ms.store(threshold_ms, Ordering::Relaxed);
    }

    /// Suppress progress lines. Metric collection continues.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Resume progress lines.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Whether progress lines are currently suppressed.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Record one completion against the global totals only.
    pub fn mark_done(&self, latency_ms: u64, level: LogLevel) {
        self.record_global(latency_ms, level);
    }

    /// Record one completion against the global totals and the category
    /// metric, creating the metric on first observation.
    pub fn mark_done_category(&self, category: &str, latency_ms: u64, level: LogLevel) {
        self.category_metric(category).record(latency_ms, level);
        self.record_global(latency_ms, level);
    }

    /// Get or create the metric for `category`. Read-mostly: the write lock
    /// is taken only on first observation of a category.
    fn category_metric(&self, category: &str) -> Arc<CategoryMetric> {
        {
            let map = self.categories.read().expect("category map poisoned");
            if let Some(metric) = map.get(category) {
                return Arc::clone(metric);
            }
        }
        let mut map = self.categories.write().expect("category map poisoned");
        Arc::clone(
            map.entry(category.to_string())
                .or_insert_with(|| Arc::new(CategoryMetric::new())),
        )
    }

    fn record_global(&self, latency_ms: u64, level: LogLevel) {
        let current = self.done.fetch_add(1, Ordering::AcqRel) + 1;
        self.latency_sum.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.level_totals[level_index(level)].fetch_add(1, Ordering::Relaxed);

        let highlight = self.highlight_ms.load(Ordering::Relaxed);
        if highlight > 0 && latency_ms > highlight {
            self.log
                .log(LogLevel::Warn, "progress", "high_latency", latency_ms, 0);
            self.log
                .dual_safe_log(&format!("[!!!] High latency job: {latency_ms}ms"));
        }

        let interval = self.log_interval.load(Ordering::Relaxed).max(1);
        if !self.is_paused() && current.saturating_sub(self.last_logged.load(Ordering::Relaxed)) >= interval
        {
            // A racing thread may emit an extra line; harmless for UX output.
            self.last_logged.store(current, Ordering::Relaxed);
            self.emit_progress_line(current);
        }
    }

    fn emit_progress_line(&self, done: u64) {
        let percent = if self.total == 0 {
            100
        } else {
            (done.saturating_mul(100) / self.total).min(100)
        };
        self.log.dual_safe_log(&format!(
            "Progress: {percent}% | ETA: {} | Avg latency: {}ms",
            self.eta_string(),
            self.average_latency_ms()
        ));
    }

    /// Global completion counts per log level.
    pub fn level_totals(&self) -> [(LogLevel, u64); 4] {
        [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ]
        .map(|level| {
            (
                level,
                self.level_totals[level_index(level)].load(Ordering::Relaxed),
            )
        })
    }

    /// Mean completion latency in ms, 0 before the first completion.
    pub fn average_latency_ms(&self) -> u64 {
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            0
        } else {
            self.latency_sum.load(Ordering::Relaxed) / count
        }
    }

    /// Estimated time to completion.
    ///
    /// `(total - done) * avg latency`, rounded up to whole seconds, shown
    /// as `<m>m<s>s` when minutes are non-zero, else `<s>s`. `"N/A"` before
    /// the first completion, `"0s"` once done.
    pub fn eta_string(&self) -> String {
        let done = self.done();
        if done >= self.total {
            return "0s".to_string();
        }
        if done == 0 {
            return "N/A".to_string();
        }
        let eta_ms = (self.total - done) * self.average_latency_ms();
        let secs = eta_ms.div_ceil(1000);
        let (mins, rem) = (secs / 60, secs % 60);
        if mins > 0 {
            format!("{mins}m{rem}s")
        } else {
            format!("{secs}s")
        }
    }

    /// Emit the end-of-run summary lines through the dual sink.
    pub fn finish(&self) {
        let elapsed_ms = self.start.elapsed().as_millis();
        self.log.dual_safe_log(&format!(
            "All workers finished. Total jobs done: {}",
            self.done()
        ));
        self.log
            .dual_safe_log(&format!("Average job latency: {}ms", self.average_latency_ms()));
        self.log
            .dual_safe_log(&format!("Total execution time: {elapsed_ms}ms"));
    }

    /// Categories sorted by name, each with its metric handle.
    fn sorted_categories(&self) -> Vec<(String, Arc<CategoryMetric>)> {
        let map = self.categories.read().expect("category map poisoned");
        let mut cats: Vec<_> = map
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        cats.sort_by(|a, b| a.0.cmp(&b.0));
        cats
    }

    /// Prometheus text exposition (format 0.0.4).
    ///
    /// Buckets are cumulative: `le="B"` counts observations with
    /// `latency <= B`. Values are non-decreasing between scrapes.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();
        out.push_str("# HELP job_latency Job completion latency in milliseconds.\n");
        out.push_str("# TYPE job_latency histogram\n");

        for (category, metric) in self.sorted_categories() {
            let stats = metric.stats.lock().expect("category mutex poisoned");
            let mut bucket_counts = [0u64; LATENCY_BUCKETS_MS.len()];
            let mut sum = 0u64;
            for &latency in &stats.latencies {
                sum += latency;
                for (i, &bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
                    if latency <= bound {
                        bucket_counts[i] += 1;
                    }
                }
            }
            let count = stats.latencies.len() as u64;
            drop(stats);

            for (i, &bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
                out.push_str(&format!(
                    "job_latency_bucket{{category=\"{category}\",le=\"{bound}\"}} {}\n",
                    bucket_counts[i]
                ));
            }
            out.push_str(&format!(
                "job_latency_bucket{{category=\"{category}\",le=\"+Inf\"}} {count}\n"
            ));
            out.push_str(&format!("job_latency_sum{{category=\"{category}\"}} {sum}\n"));
            out.push_str(&format!(
                "job_latency_count{{category=\"{category}\"}} {count}\n"
            ));
        }

        out.push_str(&format!("job_total_done {}\n", self.done()));
        out.push_str(&format!("job_total_expected {}\n", self.total));
        out
    }

    /// Per-category snapshot: count, average, min, max, plus totals.
    pub fn export_json(&self) -> serde_json::Value {
        let mut categories = serde_json::Map::new();
        for (category, metric) in self.sorted_categories() {
            let stats = metric.stats.lock().expect("category mutex poisoned");
            let count = stats.latencies.len() as u64;
            let sum: u64 = stats.latencies.iter().sum();
            let avg = if count == 0 {
                0.0
            } else {
                sum as f64 / count as f64
            };
            categories.insert(
                category,
                serde_json::json!({
                    "job_count": count,
                    "average_latency_ms": avg,
                    "min_latency_ms": stats.min,
                    "max_latency_ms": stats.max,
                }),
            );
        }

        serde_json::json!({
            "total_done": self.done(),
            "total_expected": self.total,
            "categories": categories,
        })
    }

    /// Run summary: global totals, per-category summary, per-category level
    /// counts.
    pub fn export_summary_json(&self) -> serde_json::Value {
        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        let mut categories = serde_json::Map::new();
        let mut level_summary = serde_json::Map::new();

        for (category, metric) in self.sorted_categories() {
            let stats = metric.stats.lock().expect("category mutex poisoned");
            let count = stats.latencies.len() as u64;
            let sum: u64 = stats.latencies.iter().sum();
            let avg = if count == 0 { 0 } else { sum / count };
            categories.insert(
                category.clone(),
                serde_json::json!({
                    "count": count,
                    "average_latency_ms": avg,
                    "min_latency_ms": stats.min,
                    "max_latency_ms": stats.max,
                }),
            );
            level_summary.insert(
                category,
                serde_json::json!({
                    "INFO": stats.level_counts[level_index(LogLevel::Info)],
                    "WARN": stats.level_counts[level_index(LogLevel::Warn)],
                    "ERROR": stats.level_counts[level_index(LogLevel::Error)],
                }),
            );
        }

        serde_json::json!({
            "total_jobs": self.total,
            "completed_jobs": self.done(),
            "average_latency_ms": self.average_latency_ms(),
            "total_execution_time_ms": elapsed_ms,
            "paused": self.is_paused(),
            "categories": categories,
            "levelSummary": level_summary,
        })
    }

    /// Start the metrics HTTP server on `0.0.0.0:port`.
    ///
    /// Idempotent: a second call while the server is running is a no-op.
    /// Returns the bound port on a fresh start; `None` when the server was
    /// already running or the bind failed (failure is logged and the core
    /// continues without metrics).
    pub fn start_server(self: &Arc<Self>, port: u16) -> Option<u16> {
        if self.server_started.swap(true, Ordering::AcqRel) {
            return None;
        }
        match server::start(Arc::clone(self), port) {
            Ok(bound) => {
                self.log
                    .log(LogLevel::Info, "metrics_server", "started", 0, 0);
                self.log
                    .dual_safe_log(&format!("Metrics server listening on 0.0.0.0:{bound}"));
                Some(bound)
            }
            Err(e) => {
                self.log
                    .log(LogLevel::Error, "metrics_server", "bind_failed", 0, 0);
                eprintln!("jobforge: metrics server bind failed on port {port}: {e}");
                self.server_started.store(false, Ordering::Release);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(total: u64) -> ProgressTracker {
        ProgressTracker::new(total, LogHandle::null())
    }

    #[test]
    fn eta_states() {
        let t = tracker(10);
        assert_eq!(t.eta_string(), "N/A");

        t.mark_done(1000, LogLevel::Info);
        // 9 remaining at 1000ms avg: 9s.
        assert_eq!(t.eta_string(), "9s");

        for _ in 0..9 {
            t.mark_done(1000, LogLevel::Info);
        }
        assert_eq!(t.eta_string(), "0s");
    }

    #[test]
    fn eta_minutes_format() {
        let t = tracker(100);
        t.mark_done(90_000, LogLevel::Info);
        // 99 remaining at 90s avg: 8910s = 148m30s.
        assert_eq!(t.eta_string(), "148m30s");
    }

    #[test]
    fn eta_rounds_up_to_whole_seconds() {
        let t = tracker(2);
        t.mark_done(1, LogLevel::Info);
        // 1 remaining at 1ms: ceil(1ms) = 1s.
        assert_eq!(t.eta_string(), "1s");
    }

    #[test]
    fn category_min_avg_max_ordering() {
        let t = tracker(3);
        t.mark_done_category("io", 50, LogLevel::Info);
        t.mark_done_category("io", 150, LogLevel::Info);
        t.mark_done_category("io", 100, LogLevel::Info);

        let json = t.export_json();
        let io = &json["categories"]["io"];
        let min = io["min_latency_ms"].as_u64().unwrap();
        let max = io["max_latency_ms"].as_u64().unwrap();
        let avg = io["average_latency_ms"].as_f64().unwrap();
        assert_eq!(min, 50);
        assert_eq!(max, 150);
        assert!(min as f64 <= avg && avg <= max as f64);
        assert_eq!(io["job_count"], 3);
    }

    #[test]
    fn prometheus_buckets_are_cumulative() {
        let t = tracker(4);
        for latency in [30, 80, 300, 2000] {
            t.mark_done_category("cpu", latency, LogLevel::Info);
        }
        let text = t.export_prometheus();

        let count_for = |le: &str| -> u64 {
            let needle = format!("job_latency_bucket{{category=\"cpu\",le=\"{le}\"}} ");
            text.lines()
                .find(|l| l.starts_with(&needle))
                .and_then(|l| l.rsplit(' ').next())
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| panic!("missing bucket le={le}"))
        };

        let counts = [
            count_for("50"),
            count_for("100"),
            count_for("250"),
            count_for("500"),
            count_for("1000"),
            count_for("+Inf"),
        ];
        assert_eq!(counts, [1, 2, 2, 3, 3, 4]);
        // Cumulative: non-decreasing across bounds.
        assert!(counts.windows(2).all(|w| w[0] <= w[1]));
        assert!(text.contains("job_latency_sum{category=\"cpu\"} 2410"));
        assert!(text.contains("job_latency_count{category=\"cpu\"} 4"));
        assert!(text.contains("job_total_done 4"));
        assert!(text.contains("job_total_expected 4"));
    }

    #[test]
    fn summary_shape() {
        let t = tracker(5);
        t.mark_done_category("io", 40, LogLevel::Info);
        t.mark_done_category("io", 400, LogLevel::Warn);
        t.mark_done_category("net", 100, LogLevel::Error);

        let summary = t.export_summary_json();
        assert_eq!(summary["total_jobs"], 5);
        assert_eq!(summary["completed_jobs"], 3);
        assert_eq!(summary["paused"], false);
        assert_eq!(summary["categories"]["io"]["count"], 2);
        assert_eq!(summary["categories"]["io"]["average_latency_ms"], 220);
        assert_eq!(summary["levelSummary"]["io"]["INFO"], 1);
        assert_eq!(summary["levelSummary"]["io"]["WARN"], 1);
        assert_eq!(summary["levelSummary"]["net"]["ERROR"], 1);
    }

    #[test]
    fn level_totals_accumulate() {
        let t = tracker(4);
        t.mark_done(1, LogLevel::Info);
        t.mark_done(1, LogLevel::Info);
        t.mark_done_category("io", 1, LogLevel::Error);

        let totals = t.level_totals();
        assert_eq!(totals[1], (LogLevel::Info, 2));
        assert_eq!(totals[3], (LogLevel::Error, 1));
    }

    #[test]
    fn pause_suppresses_lines_not_collection() {
        let t = tracker(2);
        t.pause();
        t.mark_done_category("io", 10, LogLevel::Info);
        assert!(t.is_paused());
        assert_eq!(t.done(), 1);
        assert_eq!(t.export_json()["categories"]["io"]["job_count"], 1);
        t.resume();
        assert!(!t.is_paused());
    }

    #[test]
    fn counters_monotone_across_exports() {
        let t = tracker(100);
        t.mark_done_category("x", 10, LogLevel::Info);
        let first = t.export_prometheus();
        t.mark_done_category("x", 10, LogLevel::Info);
        let second = t.export_prometheus();

        let grab = |text: &str, prefix: &str| -> u64 {
            text.lines()
                .find(|l| l.starts_with(prefix))
                .and_then(|l| l.rsplit(' ').next())
                .and_then(|v| v.parse().ok())
                .unwrap()
        };
        assert!(
            grab(&second, "job_latency_count{category=\"x\"}")
                >= grab(&first, "job_latency_count{category=\"x\"}")
        );
        assert!(grab(&second, "job_total_done") >= grab(&first, "job_total_done"));
    }
}
