//! Upload metrics
//!
//! Lock-free counters, gauges and a latency histogram, rendered in the
//! Prometheus text format.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Upper bounds, in seconds, of the part latency buckets
const LATENCY_BOUNDS: [f64; 10] = [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Histogram for part upload latency
pub struct Histogram {
    buckets: [AtomicU64; LATENCY_BOUNDS.len()],
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Histogram {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Observe a duration
    pub fn observe(&self, elapsed: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        let secs = elapsed.as_secs_f64();
        for (bound, count) in LATENCY_BOUNDS.iter().zip(&self.buckets) {
            if secs <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in LATENCY_BOUNDS.iter().zip(&self.buckets) {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", self.name, self.count()));

        let sum_secs = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!("{}_count {}\n", self.name, self.count()));

        output
    }
}

/// Metrics of one upload, shared by the coordinator and its workers
pub struct UploadMetrics {
    pub parts_uploaded: Counter,
    pub bytes_uploaded: Counter,
    pub part_retries: Counter,
    pub part_failures: Counter,
    pub parts_in_flight: Gauge,
    pub part_latency: Histogram,
}

impl UploadMetrics {
    pub fn new() -> Self {
        Self {
            parts_uploaded: Counter::new("ferry_parts_uploaded_total", "Parts acknowledged by the store"),
            bytes_uploaded: Counter::new("ferry_bytes_uploaded_total", "Bytes acknowledged by the store"),
            part_retries: Counter::new("ferry_part_retries_total", "Part uploads retried after a transient failure"),
            part_failures: Counter::new("ferry_part_failures_total", "Parts that failed permanently"),
            parts_in_flight: Gauge::new("ferry_parts_in_flight", "Part uploads currently in progress"),
            part_latency: Histogram::new("ferry_part_upload_duration_seconds", "Latency of successful part uploads"),
        }
    }

    /// Export all metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str(&self.parts_uploaded.to_prometheus());
        output.push_str(&self.bytes_uploaded.to_prometheus());
        output.push_str(&self.part_retries.to_prometheus());
        output.push_str(&self.part_failures.to_prometheus());
        output.push_str(&self.parts_in_flight.to_prometheus());
        output.push_str(&self.part_latency.to_prometheus());
        output
    }
}

impl Default for UploadMetrics {
    fn default() -> Self {
        Self::new()
    }
}
