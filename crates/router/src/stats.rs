//! Router and upstream stats
//!
//! Per-cluster counters are labelled with the cluster name, per-host ones
//! with `cluster/address`. Requests that never reach a cluster are counted
//! by service.

use crate::host::Host;
use proxy::metrics::{CounterVec, HistogramVec};

/// Response size buckets, in bytes
pub const SIZE_BUCKETS: &[f64] = &[
    64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0,
];

/// Response time buckets, in milliseconds
pub const TIME_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

pub struct RouterStats {
    pub route_missing: CounterVec,
    pub unknown_cluster: CounterVec,
    pub no_healthy_upstream: CounterVec,
    pub upstream_cx_total: CounterVec,
    pub upstream_cx_overflow: CounterVec,
    pub upstream_cx_connect_fail: CounterVec,
    pub upstream_rq_size: HistogramVec,
    pub upstream_resp_size: HistogramVec,
    pub upstream_resp_time: HistogramVec,
    pub upstream_resp_reply_success: CounterVec,
    pub upstream_resp_reply_error: CounterVec,
    pub upstream_resp_exception: CounterVec,
    pub upstream_resp_invalid_type: CounterVec,
    pub upstream_resp_decoding_error: CounterVec,
    pub upstream_resp_local_exception: CounterVec,
    pub upstream_cx_drain_close: CounterVec,
}

impl Default for RouterStats {
    fn default() -> Self {
        Self::new()
    }
}

fn host_label(cluster: &str, host: Option<&Host>) -> String {
    match host {
        Some(host) => host.stat_name(),
        None => cluster.to_string(),
    }
}

impl RouterStats {
    pub fn new() -> Self {
        Self {
            route_missing: CounterVec::new(),
            unknown_cluster: CounterVec::new(),
            no_healthy_upstream: CounterVec::new(),
            upstream_cx_total: CounterVec::new(),
            upstream_cx_overflow: CounterVec::new(),
            upstream_cx_connect_fail: CounterVec::new(),
            upstream_rq_size: HistogramVec::new(SIZE_BUCKETS.to_vec()),
            upstream_resp_size: HistogramVec::new(SIZE_BUCKETS.to_vec()),
            upstream_resp_time: HistogramVec::new(TIME_BUCKETS.to_vec()),
            upstream_resp_reply_success: CounterVec::new(),
            upstream_resp_reply_error: CounterVec::new(),
            upstream_resp_exception: CounterVec::new(),
            upstream_resp_invalid_type: CounterVec::new(),
            upstream_resp_decoding_error: CounterVec::new(),
            upstream_resp_local_exception: CounterVec::new(),
            upstream_cx_drain_close: CounterVec::new(),
        }
    }

    pub fn inc_route_missing(&self, service: &str) {
        self.route_missing.inc(service);
    }

    pub fn inc_unknown_cluster(&self, cluster: &str) {
        self.unknown_cluster.inc(cluster);
    }

    pub fn inc_no_healthy_upstream(&self, cluster: &str) {
        self.no_healthy_upstream.inc(cluster);
    }

    pub fn inc_connection(&self, host: &Host) {
        self.upstream_cx_total.inc(&host.stat_name());
    }

    pub fn inc_overflow(&self, host: &Host) {
        self.upstream_cx_overflow.inc(&host.stat_name());
    }

    pub fn inc_connect_fail(&self, host: &Host) {
        self.upstream_cx_connect_fail.inc(&host.stat_name());
    }

    pub fn record_request_size(&self, cluster: &str, size: u64) {
        self.upstream_rq_size.observe(cluster, size as f64);
    }

    pub fn record_response_size(&self, cluster: &str, size: u64) {
        self.upstream_resp_size.observe(cluster, size as f64);
    }

    pub fn record_response_time(&self, cluster: &str, host: Option<&Host>, millis: u64) {
        self.upstream_resp_time
            .observe(&host_label(cluster, host), millis as f64);
    }

    pub fn inc_reply_success(&self, cluster: &str, host: Option<&Host>) {
        self.upstream_resp_reply_success.inc(&host_label(cluster, host));
    }

    pub fn inc_reply_error(&self, cluster: &str, host: Option<&Host>) {
        self.upstream_resp_reply_error.inc(&host_label(cluster, host));
    }

    pub fn inc_remote_exception(&self, cluster: &str, host: Option<&Host>) {
        self.upstream_resp_exception.inc(&host_label(cluster, host));
    }

    pub fn inc_invalid_type(&self, cluster: &str, host: Option<&Host>) {
        self.upstream_resp_invalid_type.inc(&host_label(cluster, host));
    }

    pub fn inc_decoding_error(&self, cluster: &str, host: Option<&Host>) {
        self.upstream_resp_decoding_error.inc(&host_label(cluster, host));
    }

    pub fn inc_local_exception(&self, cluster: &str) {
        self.upstream_resp_local_exception.inc(cluster);
    }

    pub fn inc_close_drain(&self, cluster: &str) {
        self.upstream_cx_drain_close.inc(cluster);
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let mut output = String::new();

        let counters = [
            ("router_route_missing", "service", "Requests matching no route", &self.route_missing),
            ("router_unknown_cluster", "cluster", "Requests routed to a cluster that does not exist", &self.unknown_cluster),
            ("router_no_healthy_upstream", "cluster", "Requests finding every host ejected", &self.no_healthy_upstream),
            ("upstream_cx", "host", "Upstream connections established", &self.upstream_cx_total),
            ("upstream_cx_overflow", "host", "Connection requests over the host's connection budget", &self.upstream_cx_overflow),
            ("upstream_cx_connect_fail", "host", "Failed or timed out upstream connects", &self.upstream_cx_connect_fail),
            ("upstream_resp_reply_success", "host", "Successful replies", &self.upstream_resp_reply_success),
            ("upstream_resp_reply_error", "host", "Replies carrying an error", &self.upstream_resp_reply_error),
            ("upstream_resp_exception", "host", "Exception responses", &self.upstream_resp_exception),
            ("upstream_resp_invalid_type", "host", "Responses with an unexpected message type", &self.upstream_resp_invalid_type),
            ("upstream_resp_decoding_error", "host", "Responses that failed to decode", &self.upstream_resp_decoding_error),
            ("upstream_resp_local_exception", "cluster", "Error replies generated locally", &self.upstream_resp_local_exception),
            ("upstream_cx_drain_close", "cluster", "Upstream connections closed on a draining signal", &self.upstream_cx_drain_close),
        ];
        for (name, label, help, counter) in counters {
            output.push_str(&format!(
                "# HELP conduit_{name}_total {help}\n# TYPE conduit_{name}_total counter\n"
            ));
            for (value, count) in counter.get_all() {
                output.push_str(&format!(
                    "conduit_{name}_total{{{label}=\"{value}\"}} {count}\n"
                ));
            }
            output.push('\n');
        }

        output.push_str("# HELP conduit_upstream_rq_size_bytes Upstream request size\n");
        output.push_str("# TYPE conduit_upstream_rq_size_bytes histogram\n");
        self.upstream_rq_size
            .write(&mut output, "conduit_upstream_rq_size_bytes", "cluster");
        output.push('\n');

        output.push_str("# HELP conduit_upstream_resp_size_bytes Upstream response size\n");
        output.push_str("# TYPE conduit_upstream_resp_size_bytes histogram\n");
        self.upstream_resp_size
            .write(&mut output, "conduit_upstream_resp_size_bytes", "cluster");
        output.push('\n');

        output.push_str("# HELP conduit_upstream_resp_time_ms Upstream response time\n");
        output.push_str("# TYPE conduit_upstream_resp_time_ms histogram\n");
        self.upstream_resp_time
            .write(&mut output, "conduit_upstream_resp_time_ms", "host");

        output
    }
}
