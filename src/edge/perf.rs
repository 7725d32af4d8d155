//! Performance tracking for the edge cache.
//!
//! Keeps a bounded ring buffer of samples per metric name plus hit/miss
//! counters per bucket, for the `get_performance_metrics` and
//! `get_cache_stats` commands. Every observation is also emitted through the
//! `metrics` facade (see [`telemetry`](crate::telemetry)).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

use crate::telemetry;
use crate::time::now_millis;

/// Default number of samples kept per metric.
pub const DEFAULT_SAMPLE_CAPACITY: usize = 100;

/// One diagnostic observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub name: String,
    pub value: f64,
    pub timestamp: u64,
    pub metadata: Value,
}

/// Aggregate over the retained samples of one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub count: usize,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
}

/// Per-bucket outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BucketCounters {
    pub hits: u64,
    pub misses: u64,
    pub fallbacks: u64,
}

impl BucketCounters {
    /// Fraction of lookups served from cache; 0 when nothing was counted.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct PerformanceTracker {
    capacity: usize,
    samples: Mutex<HashMap<String, VecDeque<PerformanceSample>>>,
    counters: Mutex<HashMap<String, BucketCounters>>,
}

impl PerformanceTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Append a sample, dropping the oldest once the buffer is full.
    pub fn record(&self, name: &str, value: f64, metadata: Value) {
        let Ok(mut samples) = self.samples.lock() else {
            return;
        };
        let buffer = samples.entry(name.to_string()).or_default();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(PerformanceSample {
            name: name.to_string(),
            value,
            timestamp: now_millis(),
            metadata,
        });
    }

    pub fn record_hit(&self, bucket: &str) {
        metrics::counter!(telemetry::CACHE_HITS_TOTAL, "bucket" => bucket.to_owned()).increment(1);
        self.bump(bucket, |c| c.hits += 1);
    }

    pub fn record_miss(&self, bucket: &str) {
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "bucket" => bucket.to_owned())
            .increment(1);
        self.bump(bucket, |c| c.misses += 1);
    }

    pub fn record_fallback(&self, bucket: &str) {
        metrics::counter!(telemetry::CACHE_FALLBACKS_TOTAL, "bucket" => bucket.to_owned())
            .increment(1);
        self.bump(bucket, |c| c.fallbacks += 1);
    }

    fn bump(&self, bucket: &str, f: impl FnOnce(&mut BucketCounters)) {
        if let Ok(mut counters) = self.counters.lock() {
            f(counters.entry(bucket.to_string()).or_default());
        }
    }

    /// Retained samples for `name`, oldest first.
    pub fn samples(&self, name: &str) -> Vec<PerformanceSample> {
        self.samples
            .lock()
            .map(|s| s.get(name).map(|b| b.iter().cloned().collect()).unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn counters(&self, bucket: &str) -> BucketCounters {
        self.counters
            .lock()
            .map(|c| c.get(bucket).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Summary of every metric with at least one sample.
    pub fn summary(&self) -> BTreeMap<String, MetricSummary> {
        let Ok(samples) = self.samples.lock() else {
            return BTreeMap::new();
        };
        samples
            .iter()
            .filter_map(|(name, buffer)| summarize(buffer).map(|s| (name.clone(), s)))
            .collect()
    }

}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_CAPACITY)
    }
}

fn summarize(buffer: &VecDeque<PerformanceSample>) -> Option<MetricSummary> {
    let last = buffer.back()?.value;
    let (min, max, sum) = buffer.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY, 0.0),
        |(min, max, sum), s| (min.min(s.value), max.max(s.value), sum + s.value),
    );
    Some(MetricSummary {
        count: buffer.len(),
        average: sum / buffer.len() as f64,
        min,
        max,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ring_buffer_drops_oldest() {
        let tracker = PerformanceTracker::new(3);
        for v in 0..5 {
            tracker.record("latency", v as f64, json!(null));
        }
        let values: Vec<f64> = tracker.samples("latency").iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn summary_aggregates() {
        let tracker = PerformanceTracker::new(10);
        tracker.record("m", 1.0, json!({}));
        tracker.record("m", 3.0, json!({}));
        let summary = &tracker.summary()["m"];
        assert_eq!(summary.count, 2);
        assert_eq!(summary.average, 2.0);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 3.0);
        assert_eq!(summary.last, 3.0);
    }

    #[test]
    fn hit_rate() {
        let tracker = PerformanceTracker::default();
        tracker.record_hit("api");
        tracker.record_hit("api");
        tracker.record_miss("api");
        tracker.record_hit("api");
        let counters = tracker.counters("api");
        assert_eq!(counters.hits, 3);
        assert_eq!(counters.hit_rate(), 0.75);
        assert_eq!(tracker.counters("static").hit_rate(), 0.0);
    }
}
