//! In-process metrics
//!
//! Lightweight counters, gauges, and histograms with Prometheus text
//! exposition. No external collector required; the HTTP layer serves the
//! rendered text from `global::export_prometheus`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// A thread-safe counter metric
#[derive(Debug, Default, Clone)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A thread-safe gauge metric
#[derive(Debug, Default, Clone)]
pub struct Gauge {
    value: Arc<AtomicI64>,
}

impl Gauge {
    /// Set the value
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A histogram for tracking distributions (seconds by default)
#[derive(Debug, Clone)]
pub struct Histogram {
    bounds: Vec<f64>,
    buckets: Vec<Arc<AtomicU64>>,
    /// Running sum in micro-units to keep atomics integral
    sum_micros: Arc<AtomicU64>,
    count: Arc<AtomicU64>,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    /// Create with default latency buckets in seconds
    #[must_use]
    pub fn new() -> Self {
        Self::with_buckets(vec![
            0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
        ])
    }

    /// Create with custom bucket upper bounds
    #[must_use]
    pub fn with_buckets(bounds: Vec<f64>) -> Self {
        let buckets = bounds.iter().map(|_| Arc::new(AtomicU64::new(0))).collect();
        Self {
            bounds,
            buckets,
            sum_micros: Arc::new(AtomicU64::new(0)),
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Observe one value
    pub fn observe(&self, value: f64) {
        self.sum_micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            if value <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Observation count
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of observed values
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    /// Cumulative (bound, count) pairs
    #[must_use]
    pub fn bucket_counts(&self) -> Vec<(f64, u64)> {
        self.bounds
            .iter()
            .zip(&self.buckets)
            .map(|(bound, bucket)| (*bound, bucket.load(Ordering::Relaxed)))
            .collect()
    }
}

/// A counter accumulating fractional values (cost in USD).
///
/// Stored in micro-units so the hot path stays a single atomic add.
#[derive(Debug, Default, Clone)]
pub struct FloatCounter {
    micros: Arc<AtomicU64>,
}

impl FloatCounter {
    /// Add a value
    pub fn add(&self, value: f64) {
        self.micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> f64 {
        self.micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }
}

/// Label key - a vector of (key, value) pairs in declaration order
pub type LabelKey = Vec<(String, String)>;

fn label_key(labels: &[(&str, &str)]) -> LabelKey {
    labels
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// Format label pairs as a Prometheus label string: `{k1="v1",k2="v2"}`
#[must_use]
pub fn format_labels(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    format!("{{{}}}", parts.join(","))
}

/// A counter keeping separate values per label set
#[derive(Debug, Default, Clone)]
pub struct LabeledCounter {
    entries: Arc<RwLock<HashMap<LabelKey, Counter>>>,
}

impl LabeledCounter {
    /// Increment by 1 for the given label set
    pub fn inc(&self, labels: &[(&str, &str)]) {
        self.inc_by(labels, 1);
    }

    /// Increment by `n` for the given label set
    pub fn inc_by(&self, labels: &[(&str, &str)], n: u64) {
        let key = label_key(labels);
        let counters = self.entries.read().unwrap_or_else(|e| e.into_inner());
        if let Some(counter) = counters.get(&key) {
            counter.inc_by(n);
            return;
        }
        drop(counters);

        let mut counters = self.entries.write().unwrap_or_else(|e| e.into_inner());
        counters.entry(key).or_default().inc_by(n);
    }

    /// All (label set, value) entries
    #[must_use]
    pub fn entries(&self) -> Vec<(LabelKey, u64)> {
        let counters = self.entries.read().unwrap_or_else(|e| e.into_inner());
        counters
            .iter()
            .map(|(labels, counter)| (labels.clone(), counter.get()))
            .collect()
    }
}

/// A float counter keeping separate values per label set
#[derive(Debug, Default, Clone)]
pub struct LabeledFloatCounter {
    entries: Arc<RwLock<HashMap<LabelKey, FloatCounter>>>,
}

impl LabeledFloatCounter {
    /// Add a value for the given label set
    pub fn add(&self, labels: &[(&str, &str)], value: f64) {
        let key = label_key(labels);
        let counters = self.entries.read().unwrap_or_else(|e| e.into_inner());
        if let Some(counter) = counters.get(&key) {
            counter.add(value);
            return;
        }
        drop(counters);

        let mut counters = self.entries.write().unwrap_or_else(|e| e.into_inner());
        counters.entry(key).or_default().add(value);
    }

    /// All (label set, value) entries
    #[must_use]
    pub fn entries(&self) -> Vec<(LabelKey, f64)> {
        let counters = self.entries.read().unwrap_or_else(|e| e.into_inner());
        counters
            .iter()
            .map(|(labels, counter)| (labels.clone(), counter.get()))
            .collect()
    }
}

/// A gauge keeping separate values per label set
#[derive(Debug, Default, Clone)]
pub struct LabeledGauge {
    entries: Arc<RwLock<HashMap<LabelKey, Gauge>>>,
}

impl LabeledGauge {
    /// Set the value for the given label set
    pub fn set(&self, labels: &[(&str, &str)], value: i64) {
        self.gauge(labels).set(value);
    }

    /// Increment the value for the given label set
    pub fn inc(&self, labels: &[(&str, &str)]) {
        self.gauge(labels).inc();
    }

    /// Decrement the value for the given label set
    pub fn dec(&self, labels: &[(&str, &str)]) {
        self.gauge(labels).dec();
    }

    fn gauge(&self, labels: &[(&str, &str)]) -> Gauge {
        let key = label_key(labels);
        let gauges = self.entries.read().unwrap_or_else(|e| e.into_inner());
        if let Some(gauge) = gauges.get(&key) {
            return gauge.clone();
        }
        drop(gauges);

        let mut gauges = self.entries.write().unwrap_or_else(|e| e.into_inner());
        gauges.entry(key).or_default().clone()
    }

    /// All (label set, value) entries
    #[must_use]
    pub fn entries(&self) -> Vec<(LabelKey, i64)> {
        let gauges = self.entries.read().unwrap_or_else(|e| e.into_inner());
        gauges
            .iter()
            .map(|(labels, gauge)| (labels.clone(), gauge.get()))
            .collect()
    }
}

/// A histogram keeping separate distributions per label set
#[derive(Debug, Clone)]
pub struct LabeledHistogram {
    entries: Arc<RwLock<HashMap<LabelKey, Histogram>>>,
    bounds: Vec<f64>,
}

impl Default for LabeledHistogram {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            bounds: Histogram::new().bounds,
        }
    }
}

impl LabeledHistogram {
    /// Observe a value for the given label set
    pub fn observe(&self, labels: &[(&str, &str)], value: f64) {
        let key = label_key(labels);
        let histograms = self.entries.read().unwrap_or_else(|e| e.into_inner());
        if let Some(histogram) = histograms.get(&key) {
            histogram.observe(value);
            return;
        }
        drop(histograms);

        let mut histograms = self.entries.write().unwrap_or_else(|e| e.into_inner());
        histograms
            .entry(key)
            .or_insert_with(|| Histogram::with_buckets(self.bounds.clone()))
            .observe(value);
    }

    /// All (label set, histogram) entries
    #[must_use]
    pub fn entries(&self) -> Vec<(LabelKey, Histogram)> {
        let histograms = self.entries.read().unwrap_or_else(|e| e.into_inner());
        histograms
            .iter()
            .map(|(labels, histogram)| (labels.clone(), histogram.clone()))
            .collect()
    }
}

/// Timer for measuring durations in seconds
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed seconds
    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Metrics registry holding all metric families
#[derive(Debug, Default, Clone)]
pub struct MetricsRegistry {
    counters: Arc<RwLock<HashMap<String, Counter>>>,
    gauges: Arc<RwLock<HashMap<String, Gauge>>>,
    labeled_counters: Arc<RwLock<HashMap<String, LabeledCounter>>>,
    labeled_float_counters: Arc<RwLock<HashMap<String, LabeledFloatCounter>>>,
    labeled_gauges: Arc<RwLock<HashMap<String, LabeledGauge>>>,
    labeled_histograms: Arc<RwLock<HashMap<String, LabeledHistogram>>>,
}

macro_rules! get_or_create {
    ($self:ident, $field:ident, $name:ident) => {{
        let map = $self.$field.read().unwrap_or_else(|e| e.into_inner());
        if let Some(metric) = map.get($name) {
            return metric.clone();
        }
        drop(map);

        let mut map = $self.$field.write().unwrap_or_else(|e| e.into_inner());
        map.entry($name.to_string()).or_default().clone()
    }};
}

impl MetricsRegistry {
    /// Create a new registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a counter
    pub fn counter(&self, name: &str) -> Counter {
        get_or_create!(self, counters, name)
    }

    /// Get or create a gauge
    pub fn gauge(&self, name: &str) -> Gauge {
        get_or_create!(self, gauges, name)
    }

    /// Get or create a labeled counter
    pub fn labeled_counter(&self, name: &str) -> LabeledCounter {
        get_or_create!(self, labeled_counters, name)
    }

    /// Get or create a labeled float counter
    pub fn labeled_float_counter(&self, name: &str) -> LabeledFloatCounter {
        get_or_create!(self, labeled_float_counters, name)
    }

    /// Get or create a labeled gauge
    pub fn labeled_gauge(&self, name: &str) -> LabeledGauge {
        get_or_create!(self, labeled_gauges, name)
    }

    /// Get or create a labeled histogram
    pub fn labeled_histogram(&self, name: &str) -> LabeledHistogram {
        get_or_create!(self, labeled_histograms, name)
    }

    /// Export all metrics in Prometheus text format
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        for (name, counter) in counters.iter() {
            output.push_str(&format!("# TYPE {name} counter\n{name} {}\n", counter.get()));
        }

        let gauges = self.gauges.read().unwrap_or_else(|e| e.into_inner());
        for (name, gauge) in gauges.iter() {
            output.push_str(&format!("# TYPE {name} gauge\n{name} {}\n", gauge.get()));
        }

        let labeled_counters = self
            .labeled_counters
            .read()
            .unwrap_or_else(|e| e.into_inner());
        for (name, counter) in labeled_counters.iter() {
            output.push_str(&format!("# TYPE {name} counter\n"));
            for (labels, value) in counter.entries() {
                output.push_str(&format!("{name}{} {value}\n", format_labels(&labels)));
            }
        }

        let labeled_float_counters = self
            .labeled_float_counters
            .read()
            .unwrap_or_else(|e| e.into_inner());
        for (name, counter) in labeled_float_counters.iter() {
            output.push_str(&format!("# TYPE {name} counter\n"));
            for (labels, value) in counter.entries() {
                output.push_str(&format!("{name}{} {value}\n", format_labels(&labels)));
            }
        }

        let labeled_gauges = self
            .labeled_gauges
            .read()
            .unwrap_or_else(|e| e.into_inner());
        for (name, gauge) in labeled_gauges.iter() {
            output.push_str(&format!("# TYPE {name} gauge\n"));
            for (labels, value) in gauge.entries() {
                output.push_str(&format!("{name}{} {value}\n", format_labels(&labels)));
            }
        }

        let labeled_histograms = self
            .labeled_histograms
            .read()
            .unwrap_or_else(|e| e.into_inner());
        for (name, family) in labeled_histograms.iter() {
            output.push_str(&format!("# TYPE {name} histogram\n"));
            for (labels, histogram) in family.entries() {
                let label_str = format_labels(&labels);
                for (bound, count) in histogram.bucket_counts() {
                    let mut bucket_labels = labels.clone();
                    bucket_labels.push(("le".to_string(), format!("{bound}")));
                    output.push_str(&format!(
                        "{name}_bucket{} {count}\n",
                        format_labels(&bucket_labels)
                    ));
                }
                let mut inf_labels = labels.clone();
                inf_labels.push(("le".to_string(), "+Inf".to_string()));
                output.push_str(&format!(
                    "{name}_bucket{} {}\n",
                    format_labels(&inf_labels),
                    histogram.count()
                ));
                output.push_str(&format!("{name}_sum{label_str} {}\n", histogram.sum()));
                output.push_str(&format!("{name}_count{label_str} {}\n", histogram.count()));
            }
        }

        output
    }
}

/// Global metrics for the process
pub mod global {
    use super::{
        Counter, Gauge, LabeledCounter, LabeledFloatCounter, LabeledGauge, LabeledHistogram,
        MetricsRegistry,
    };
    use std::sync::OnceLock;

    static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

    /// The global registry
    pub fn registry() -> &'static MetricsRegistry {
        REGISTRY.get_or_init(MetricsRegistry::new)
    }

    /// Get a counter from the global registry
    pub fn counter(name: &str) -> Counter {
        registry().counter(name)
    }

    /// Get a gauge from the global registry
    pub fn gauge(name: &str) -> Gauge {
        registry().gauge(name)
    }

    /// Get a labeled counter from the global registry
    pub fn labeled_counter(name: &str) -> LabeledCounter {
        registry().labeled_counter(name)
    }

    /// Get a labeled float counter from the global registry
    pub fn labeled_float_counter(name: &str) -> LabeledFloatCounter {
        registry().labeled_float_counter(name)
    }

    /// Get a labeled gauge from the global registry
    pub fn labeled_gauge(name: &str) -> LabeledGauge {
        registry().labeled_gauge(name)
    }

    /// Get a labeled histogram from the global registry
    pub fn labeled_histogram(name: &str) -> LabeledHistogram {
        registry().labeled_histogram(name)
    }

    /// Export all metrics in Prometheus text format
    pub fn export_prometheus() -> String {
        registry().export_prometheus()
    }
}
