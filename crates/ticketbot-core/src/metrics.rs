//! Pipeline counters and per-stage timings.
//!
//! Counters are process-lifetime totals shared across ticks; stage timings
//! belong to a single tick and travel in its report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::json;

/// Named counters the pipeline bumps as it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Counter {
    Ticks,
    TicksAborted,
    TicksSkippedLease,
    ColdStartMeta,
    ColdStartLog,
    RetriesAdmitted,
    NotificationsSent,
    NotificationsFailed,
    StorageWriteErrors,
    FilesPruned,
}

impl Counter {
    pub const ALL: [Self; 10] = [
        Self::Ticks,
        Self::TicksAborted,
        Self::TicksSkippedLease,
        Self::ColdStartMeta,
        Self::ColdStartLog,
        Self::RetriesAdmitted,
        Self::NotificationsSent,
        Self::NotificationsFailed,
        Self::StorageWriteErrors,
        Self::FilesPruned,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ticks => "ticks",
            Self::TicksAborted => "ticks_aborted",
            Self::TicksSkippedLease => "ticks_skipped_lease",
            Self::ColdStartMeta => "cold_start_meta",
            Self::ColdStartLog => "cold_start_log",
            Self::RetriesAdmitted => "retries_admitted",
            Self::NotificationsSent => "notifications_sent",
            Self::NotificationsFailed => "notifications_failed",
            Self::StorageWriteErrors => "storage_write_errors",
            Self::FilesPruned => "files_pruned",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Atomic totals indexed by [`Counter`].
#[derive(Debug, Default)]
pub struct PipelineCounters {
    values: [AtomicU64; 10],
}

impl PipelineCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, by: u64) {
        self.values[counter.index()].fetch_add(by, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter.index()].load(Ordering::Relaxed)
    }

    /// Render all counters as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = Counter::ALL
            .iter()
            .map(|c| (c.name().to_string(), json!(self.get(*c))))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Render all counters as a two-column table.
    #[must_use]
    pub fn display_table(&self) -> String {
        let mut out = String::new();
        out.push_str("counter                      value\n");
        out.push_str("----------------------------------\n");
        for counter in Counter::ALL {
            out.push_str(&format!("{:<28} {:>5}\n", counter.name(), self.get(counter)));
        }
        out
    }
}

/// Wall time spent in each stage of one tick, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageTimings {
    pub stages: Vec<(&'static str, Duration)>,
}

impl StageTimings {
    /// Run `f`, recording how long it took under `name`.
    pub fn timed<R>(&mut self, name: &'static str, f: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let result = f();
        self.stages.push((name, started.elapsed()));
        result
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Duration> {
        self.stages
            .iter()
            .find(|(stage, _)| *stage == name)
            .map(|(_, elapsed)| *elapsed)
    }

    #[must_use]
    pub fn total(&self) -> Duration {
        self.stages.iter().map(|(_, elapsed)| *elapsed).sum()
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let stages = self
            .stages
            .iter()
            .map(|(name, elapsed)| json!({ "name": name, "elapsed_us": elapsed.as_micros() }))
            .collect::<Vec<_>>();
        json!({ "stages": stages, "total_us": self.total().as_micros() })
    }
}

/// Human-friendly duration: `1.204s`, `12.050ms`, `830µs`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let micros = duration.as_micros();

    if micros >= 1_000_000 {
        let secs = micros / 1_000_000;
        let millis = (micros % 1_000_000) / 1_000;
        format!("{secs}.{millis:03}s")
    } else if micros >= 1_000 {
        let millis = micros / 1_000;
        let rem = micros % 1_000;
        format!("{millis}.{rem:03}ms")
    } else {
        format!("{micros}µs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let counters = PipelineCounters::new();
        counters.incr(Counter::Ticks);
        counters.incr(Counter::Ticks);
        counters.add(Counter::FilesPruned, 3);
        assert_eq!(counters.get(Counter::Ticks), 2);
        assert_eq!(counters.get(Counter::FilesPruned), 3);
        assert_eq!(counters.get(Counter::ColdStartLog), 0);

        let json = counters.to_json();
        assert_eq!(json["ticks"], 2);
        assert_eq!(json["files_pruned"], 3);
        assert!(counters.display_table().contains("cold_start_meta"));
    }

    #[test]
    fn counter_indices_match_all_order() {
        for (idx, counter) in Counter::ALL.iter().enumerate() {
            assert_eq!(counter.index(), idx);
        }
    }

    #[test]
    fn stage_timings_record_in_order() {
        let mut timings = StageTimings::default();
        let value = timings.timed("build", || 7_u8);
        timings.timed("diff", || ());
        assert_eq!(value, 7);
        let names: Vec<&str> = timings.stages.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["build", "diff"]);
        assert!(timings.get("build").is_some());
        assert!(timings.get("notify").is_none());
        assert_eq!(timings.to_json()["stages"][1]["name"], "diff");
    }

    #[test]
    fn durations_format_by_magnitude() {
        assert_eq!(format_duration(Duration::from_micros(830)), "830µs");
        assert_eq!(format_duration(Duration::from_micros(12_050)), "12.050ms");
        assert_eq!(format_duration(Duration::from_micros(1_204_000)), "1.204s");
    }
}
