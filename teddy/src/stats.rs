//! Online aggregation of tracer records.
//!
//! Each metric keeps a Welford accumulator, so memory per task is constant no
//! matter how long the session runs. The stream is lossy; statistics describe
//! whatever records arrived.

use std::collections::BTreeMap;

use teddy_common::TraceEvent;

const NS_PER_MS: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: u64,
    max: u64,
}

impl RunningStats {
    pub fn push(&mut self, value: u64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        let x = value as f64;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation; zero below two samples.
    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / self.count as f64).max(0.0).sqrt()
    }

    pub fn min(&self) -> Option<u64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<u64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean_ms(&self) -> f64 {
        self.mean / NS_PER_MS
    }

    pub fn std_dev_ms(&self) -> f64 {
        self.std_dev() / NS_PER_MS
    }

    pub fn min_ms(&self) -> f64 {
        self.min().unwrap_or(0) as f64 / NS_PER_MS
    }

    pub fn max_ms(&self) -> f64 {
        self.max().unwrap_or(0) as f64 / NS_PER_MS
    }
}

/// Everything known about one traced task.
#[derive(Debug, Clone, Default)]
pub struct TaskProfile {
    pub events: u64,
    pub runtime: RunningStats,
    pub sleep_duration: RunningStats,
    /// Time between consecutive distinct sleep starts.
    pub sleep_interval: RunningStats,
    last_sleep_start: u64,
}

impl TaskProfile {
    pub fn record(&mut self, event: &TraceEvent) {
        self.events += 1;
        self.runtime.push(event.runtime_ns);

        if let Some(slept) = event.sleep_duration() {
            self.sleep_duration.push(slept);
        }

        // The same start is repeated by every record until the next sleep.
        let start = event.sleep_start;
        if start != 0 && start > self.last_sleep_start {
            if self.last_sleep_start != 0 {
                self.sleep_interval.push(start - self.last_sleep_start);
            }
            self.last_sleep_start = start;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    tasks: BTreeMap<i32, TaskProfile>,
    events: u64,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consume(&mut self, event: &TraceEvent) {
        self.events += 1;
        self.tasks.entry(event.tid).or_default().record(event);
    }

    pub fn total_events(&self) -> u64 {
        self.events
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, tid: i32) -> Option<&TaskProfile> {
        self.tasks.get(&tid)
    }

    /// Profiles in ascending task id order.
    pub fn tasks(&self) -> impl Iterator<Item = (i32, &TaskProfile)> {
        self.tasks.iter().map(|(tid, profile)| (*tid, profile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn event(tid: i32, sleep_start: u64, sleep_end: u64, runtime_ns: u64) -> TraceEvent {
        TraceEvent {
            tid,
            _pad: 0,
            sleep_start,
            sleep_end,
            runtime_ns,
        }
    }

    #[test]
    fn running_stats_over_known_samples() {
        let mut stats = RunningStats::default();
        for v in [2, 4, 4, 4, 5, 5, 7, 9] {
            stats.push(v);
        }
        assert_eq!(stats.count(), 8);
        assert!((stats.mean() - 5.0).abs() < 1e-9);
        assert!((stats.std_dev() - 2.0).abs() < 1e-9);
        assert_eq!(stats.min(), Some(2));
        assert_eq!(stats.max(), Some(9));
    }

    #[test]
    fn empty_and_single_sample() {
        let mut stats = RunningStats::default();
        assert!(stats.is_empty());
        assert_eq!(stats.min(), None);
        stats.push(3 * MS);
        assert_eq!(stats.std_dev(), 0.0);
        assert!((stats.mean_ms() - 3.0).abs() < 1e-9);
        assert_eq!(stats.min_ms(), 3.0);
    }

    #[test]
    fn single_sleep_of_fifty_ms() {
        let mut agg = Aggregator::new();
        agg.consume(&event(100, 10 * MS, 60 * MS, 4 * MS));

        let profile = agg.task(100).unwrap();
        assert_eq!(profile.events, 1);
        assert_eq!(profile.sleep_duration.count(), 1);
        assert!((profile.sleep_duration.mean_ms() - 50.0).abs() < 1e-9);
        assert!((profile.runtime.mean_ms() - 4.0).abs() < 1e-9);
        assert!(profile.sleep_interval.is_empty());
    }

    #[test]
    fn runtime_only_records_skip_sleep_metrics() {
        let mut agg = Aggregator::new();
        agg.consume(&event(5, 0, 0, 1_000 * MS));
        agg.consume(&event(5, 0, 0, 1_001 * MS));
        // Open window without an end.
        agg.consume(&event(5, 7 * MS, 0, 2 * MS));

        let profile = agg.task(5).unwrap();
        assert_eq!(profile.runtime.count(), 3);
        assert!(profile.sleep_duration.is_empty());
    }

    #[test]
    fn sleep_interval_counts_distinct_starts_only() {
        let mut agg = Aggregator::new();
        agg.consume(&event(1, 10 * MS, 20 * MS, MS));
        // Long-run flush repeating the same start.
        agg.consume(&event(1, 10 * MS, 0, 1_000 * MS));
        agg.consume(&event(1, 40 * MS, 45 * MS, MS));
        agg.consume(&event(1, 100 * MS, 130 * MS, MS));

        let profile = agg.task(1).unwrap();
        assert_eq!(profile.sleep_interval.count(), 2);
        assert_eq!(profile.sleep_interval.min(), Some(30 * MS));
        assert_eq!(profile.sleep_interval.max(), Some(60 * MS));
        assert_eq!(profile.sleep_duration.count(), 3);
    }

    #[test]
    fn tasks_are_kept_apart_and_sorted() {
        let mut agg = Aggregator::new();
        agg.consume(&event(30, 0, 0, MS));
        agg.consume(&event(10, 0, 0, 2 * MS));
        agg.consume(&event(30, 0, 0, 3 * MS));

        let tids: Vec<i32> = agg.tasks().map(|(tid, _)| tid).collect();
        assert_eq!(tids, vec![10, 30]);
        assert_eq!(agg.task(30).unwrap().events, 2);
        assert_eq!(agg.total_events(), 3);
    }
}
