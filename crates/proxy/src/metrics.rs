//! Prometheus metrics for conduit
//!
//! Atomic stats sinks shared across connections, and the per-listener
//! [`ProxyStats`] block with its Prometheus text export.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default request duration buckets, in seconds
pub const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Stats for one listener's downstream side
pub struct ProxyStats {
    prefix: String,
    /// Connections accepted
    pub downstream_cx_total: Counter,
    /// Connections currently open
    pub downstream_cx_active: Gauge,
    /// Connections closed because the listener was draining
    pub downstream_cx_drain_close: Counter,
    /// Requests decoded
    pub downstream_rq_total: Counter,
    /// Streams currently in flight
    pub downstream_rq_active: Gauge,
    /// Frames the codec could not decode
    pub downstream_rq_decoding_error: Counter,
    /// Replies synthesized locally
    pub downstream_rq_local_reply: Counter,
    /// Streams reset before completion
    pub downstream_rq_reset: Counter,
    /// Completed replies by status code
    pub downstream_rq_by_status: CounterVec,
    /// Stream lifetime in seconds
    pub downstream_rq_time: Histogram,
    start_time: Instant,
}

impl ProxyStats {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            downstream_cx_total: Counter::new(),
            downstream_cx_active: Gauge::new(),
            downstream_cx_drain_close: Counter::new(),
            downstream_rq_total: Counter::new(),
            downstream_rq_active: Gauge::new(),
            downstream_rq_decoding_error: Counter::new(),
            downstream_rq_local_reply: Counter::new(),
            downstream_rq_reset: Counter::new(),
            downstream_rq_by_status: CounterVec::new(),
            downstream_rq_time: Histogram::new(DURATION_BUCKETS.to_vec()),
            start_time: Instant::now(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let mut output = String::new();
        let p = &self.prefix;

        output.push_str(&format!(
            "# HELP conduit_uptime_seconds Listener uptime in seconds\n\
             # TYPE conduit_uptime_seconds gauge\n\
             conduit_uptime_seconds{{listener=\"{}\"}} {}\n\n",
            p,
            self.start_time.elapsed().as_secs()
        ));

        let counters = [
            ("downstream_cx_total", "Downstream connections accepted", &self.downstream_cx_total),
            ("downstream_cx_drain_close", "Connections closed by drain", &self.downstream_cx_drain_close),
            ("downstream_rq_total", "Downstream requests decoded", &self.downstream_rq_total),
            ("downstream_rq_decoding_error", "Downstream decoding errors", &self.downstream_rq_decoding_error),
            ("downstream_rq_local_reply", "Locally generated replies", &self.downstream_rq_local_reply),
            ("downstream_rq_reset", "Streams reset before completion", &self.downstream_rq_reset),
        ];
        for (name, help, counter) in counters {
            output.push_str(&format!(
                "# HELP conduit_{name} {help}\n# TYPE conduit_{name} counter\nconduit_{name}{{listener=\"{p}\"}} {}\n\n",
                counter.get()
            ));
        }

        let gauges = [
            ("downstream_cx_active", "Open downstream connections", &self.downstream_cx_active),
            ("downstream_rq_active", "In-flight downstream streams", &self.downstream_rq_active),
        ];
        for (name, help, gauge) in gauges {
            output.push_str(&format!(
                "# HELP conduit_{name} {help}\n# TYPE conduit_{name} gauge\nconduit_{name}{{listener=\"{p}\"}} {}\n\n",
                gauge.get()
            ));
        }

        output.push_str("# HELP conduit_downstream_rq_by_status_total Replies by status code\n");
        output.push_str("# TYPE conduit_downstream_rq_by_status_total counter\n");
        for (status, count) in self.downstream_rq_by_status.get_all() {
            output.push_str(&format!(
                "conduit_downstream_rq_by_status_total{{listener=\"{}\",status=\"{}\"}} {}\n",
                p, status, count
            ));
        }
        output.push('\n');

        output.push_str("# HELP conduit_downstream_rq_time_seconds Stream duration in seconds\n");
        output.push_str("# TYPE conduit_downstream_rq_time_seconds histogram\n");
        write_histogram(
            &mut output,
            "conduit_downstream_rq_time_seconds",
            &format!("listener=\"{}\"", p),
            &self.downstream_rq_time,
        );

        output
    }
}

/// Append one histogram's bucket, sum and count lines
pub fn write_histogram(output: &mut String, name: &str, labels: &str, histogram: &Histogram) {
    let (buckets, sum, count) = histogram.get_stats();
    for (le, bucket_count) in buckets {
        output.push_str(&format!(
            "{}_bucket{{{},le=\"{}\"}} {}\n",
            name, labels, le, bucket_count
        ));
    }
    output.push_str(&format!("{}_bucket{{{},le=\"+Inf\"}} {}\n", name, labels, count));
    output.push_str(&format!("{}_sum{{{}}} {}\n", name, labels, sum));
    output.push_str(&format!("{}_count{{{}}} {}\n", name, labels, count));
}

/// Simple atomic counter
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, v: u64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter with labels
pub struct CounterVec {
    values: RwLock<HashMap<String, u64>>,
}

impl CounterVec {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn inc(&self, label: &str) {
        let mut values = self.values.write();
        *values.entry(label.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, label: &str) -> u64 {
        self.values.read().get(label).copied().unwrap_or(0)
    }

    /// All labels, sorted for stable export
    pub fn get_all(&self) -> Vec<(String, u64)> {
        let mut all: Vec<_> = self
            .values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        all.sort();
        all
    }
}

impl Default for CounterVec {
    fn default() -> Self {
        Self::new()
    }
}

/// Simple gauge (can go up and down)
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement, saturating at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Simple histogram with cumulative buckets
pub struct Histogram {
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    sum: RwLock<f64>,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let bucket_counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            bucket_counts,
            sum: RwLock::new(0.0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        {
            let mut sum = self.sum.write();
            *sum += value;
        }
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, &bucket_le) in self.buckets.iter().enumerate() {
            if value <= bucket_le {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_stats(&self) -> (Vec<(f64, u64)>, f64, u64) {
        let buckets: Vec<_> = self
            .buckets
            .iter()
            .zip(self.bucket_counts.iter())
            .map(|(&le, count)| (le, count.load(Ordering::Relaxed)))
            .collect();
        let sum = *self.sum.read();
        let count = self.count.load(Ordering::Relaxed);
        (buckets, sum, count)
    }
}

/// Histogram with labels, all sharing one bucket layout
pub struct HistogramVec {
    buckets: Vec<f64>,
    histograms: DashMap<String, Histogram>,
}

impl HistogramVec {
    pub fn new(buckets: Vec<f64>) -> Self {
        Self {
            buckets,
            histograms: DashMap::new(),
        }
    }

    pub fn observe(&self, label: &str, value: f64) {
        if let Some(histogram) = self.histograms.get(label) {
            histogram.observe(value);
            return;
        }
        self.histograms
            .entry(label.to_string())
            .or_insert_with(|| Histogram::new(self.buckets.clone()))
            .observe(value);
    }

    /// Number of observations recorded under `label`
    pub fn count(&self, label: &str) -> u64 {
        self.histograms.get(label).map(|h| h.count()).unwrap_or(0)
    }

    /// Sum of observations recorded under `label`
    pub fn sum(&self, label: &str) -> f64 {
        self.histograms
            .get(label)
            .map(|h| h.get_stats().1)
            .unwrap_or(0.0)
    }

    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<_> = self.histograms.iter().map(|e| e.key().clone()).collect();
        labels.sort();
        labels
    }

    /// Append every labelled histogram to `output`
    pub fn write(&self, output: &mut String, name: &str, label_name: &str) {
        for label in self.labels() {
            if let Some(histogram) = self.histograms.get(&label) {
                write_histogram(
                    output,
                    name,
                    &format!("{}=\"{}\"", label_name, label),
                    &histogram,
                );
            }
        }
    }
}

/// Wait for active connections to drain (with timeout)
/// Returns true if all connections drained, false if timeout
pub fn wait_for_connections_drain<'a, I>(stats: I, timeout: Duration) -> bool
where
    I: IntoIterator<Item = &'a ProxyStats> + Clone,
{
    let start = Instant::now();
    let check_interval = Duration::from_millis(100);

    loop {
        let active: u64 = stats
            .clone()
            .into_iter()
            .map(|s| s.downstream_cx_active.get())
            .sum();
        if active == 0 {
            return true;
        }

        if start.elapsed() >= timeout {
            tracing::warn!(
                active_connections = active,
                "Grace period expired with active connections"
            );
            return false;
        }

        std::thread::sleep(check_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.inc();
        assert_eq!(counter.get(), 1);
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_counter_vec() {
        let counter = CounterVec::new();
        counter.inc("ok");
        counter.inc("ok");
        counter.inc("not_found");
        assert_eq!(counter.get("ok"), 2);
        assert_eq!(counter.get("not_found"), 1);
        assert_eq!(counter.get("internal"), 0);
        assert_eq!(counter.get_all()[0].0, "not_found");
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new();
        gauge.inc();
        gauge.inc();
        assert_eq!(gauge.get(), 2);
        gauge.dec();
        assert_eq!(gauge.get(), 1);
        gauge.set(10);
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_gauge_does_not_underflow() {
        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::new(vec![0.1, 0.5, 1.0]);
        histogram.observe(0.05);
        histogram.observe(0.3);
        histogram.observe(0.8);
        histogram.observe(2.0);

        let (buckets, sum, count) = histogram.get_stats();
        assert_eq!(count, 4);
        assert!((sum - 3.15).abs() < 0.001);

        // Cumulative
        assert_eq!(buckets[0].1, 1);
        assert_eq!(buckets[1].1, 2);
        assert_eq!(buckets[2].1, 3);
    }

    #[test]
    fn test_histogram_vec() {
        let histograms = HistogramVec::new(vec![10.0, 100.0]);
        histograms.observe("users", 5.0);
        histograms.observe("users", 50.0);
        histograms.observe("orders", 500.0);

        assert_eq!(histograms.count("users"), 2);
        assert_eq!(histograms.count("orders"), 1);
        assert_eq!(histograms.count("missing"), 0);
        assert!((histograms.sum("users") - 55.0).abs() < f64::EPSILON);
        assert_eq!(histograms.labels(), vec!["orders", "users"]);

        let mut output = String::new();
        histograms.write(&mut output, "upstream_rq_size", "cluster");
        assert!(output.contains("upstream_rq_size_count{cluster=\"users\"} 2"));
    }

    #[test]
    fn test_proxy_stats_export() {
        let stats = ProxyStats::new("ingress");
        stats.downstream_rq_total.inc();
        stats.downstream_rq_by_status.inc("ok");
        stats.downstream_rq_time.observe(0.02);

        let output = stats.export();
        assert!(output.contains("conduit_downstream_rq_total{listener=\"ingress\"} 1"));
        assert!(output.contains(
            "conduit_downstream_rq_by_status_total{listener=\"ingress\",status=\"ok\"} 1"
        ));
        assert!(output.contains("conduit_downstream_rq_time_seconds_count{listener=\"ingress\"} 1"));
    }

    #[test]
    fn test_wait_for_connections_drain() {
        let stats = ProxyStats::new("ingress");
        assert!(wait_for_connections_drain([&stats], Duration::from_millis(10)));

        stats.downstream_cx_active.inc();
        assert!(!wait_for_connections_drain([&stats], Duration::from_millis(10)));
    }
}
