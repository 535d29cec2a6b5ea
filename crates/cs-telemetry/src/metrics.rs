use ahash::AHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

// ---------------------------------------------------------------------------
// f64 cell
// ---------------------------------------------------------------------------

/// `f64` stored as raw bits in an `AtomicU64`.
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    fn add(&self, delta: f64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Cumulative-bucket histogram in the Prometheus sense.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum: AtomicF64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicF64::default(),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.add(value);
        // Only the first matching bucket is bumped; export accumulates.
        if let Some(i) = self.buckets.iter().position(|b| value <= *b) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sum(&self) -> f64 {
        self.sum.load()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// `(upper bound, cumulative count)` pairs, without `+Inf`.
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        self.buckets
            .iter()
            .zip(&self.counts)
            .map(|(b, c)| {
                running += c.load(Ordering::Relaxed);
                (*b, running)
            })
            .collect()
    }
}

/// Seconds; tuned for LLM calls and container commands, which run long.
fn default_duration_buckets() -> Vec<f64> {
    vec![
        0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
    ]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted `key=value` pairs identifying one series of a metric family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort();
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// `{key="value",...}` with Prometheus escaping, or empty.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", escape_label(v)))
            .collect();
        format!("{{{}}}", inner.join(","))
    }

    fn with_extra(&self, key: &str, value: &str) -> String {
        let mut pairs: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", escape_label(v)))
            .collect();
        pairs.push(format!("{key}=\"{value}\""));
        format!("{{{}}}", pairs.join(","))
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

type Series<T> = RwLock<AHashMap<(String, Labels), T>>;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Process-wide counters, gauges and histograms, all labelled.
///
/// Series are created lazily on first use. Reads take the shared lock
/// and update atomics in place; only new series take the write lock.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: Series<AtomicU64>,
    gauges: Series<AtomicF64>,
    histograms: Series<Histogram>,
    help: RwLock<AHashMap<String, String>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collector with HELP text registered for the platform's metric families.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        for (name, help) in [
            ("cs_tasks_total", "Tasks that reached a terminal state"),
            ("cs_task_iterations", "Fix-loop iterations per finished task"),
            ("cs_llm_requests_total", "LLM requests by model and result"),
            ("cs_llm_request_duration_seconds", "LLM request latency"),
            ("cs_llm_tokens_total", "Tokens reported by the LLM server"),
            ("cs_container_ops_total", "Container runtime operations"),
            ("cs_containers_live", "Running managed containers"),
            ("cs_autoscale_actions_total", "Applied autoscaler actions"),
            ("cs_squad_slots", "Current squad-slot capacity"),
            ("cs_bus_messages_total", "Messages published on the bus"),
            ("cs_bus_dropped_total", "Bus deliveries dropped on full subscribers"),
            ("cs_split_runs_total", "Split executor runs by result"),
            ("cs_escalations_total", "Coordinator escalation steps"),
            ("api_requests_total", "HTTP requests served"),
            ("api_request_duration_seconds", "HTTP request latency"),
        ] {
            collector.describe(name, help);
        }
        collector
    }

    pub fn describe(&self, name: &str, help: &str) {
        write(&self.help).insert(name.to_string(), help.to_string());
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(c) = read(&self.counters).get(&key) {
            c.fetch_add(amount, Ordering::Relaxed);
            return;
        }
        write(&self.counters)
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.counters)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(g) = read(&self.gauges).get(&key) {
            g.store(value);
            return;
        }
        write(&self.gauges).entry(key).or_default().store(value);
    }

    pub fn add_gauge(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(g) = read(&self.gauges).get(&key) {
            g.add(delta);
            return;
        }
        write(&self.gauges).entry(key).or_default().add(delta);
    }

    pub fn get_gauge(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.gauges).get(&key).map(|g| g.load()).unwrap_or(0.0)
    }

    // -- Histograms ---------------------------------------------------------

    pub fn record_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(h) = read(&self.histograms).get(&key) {
            h.observe(value);
            return;
        }
        write(&self.histograms)
            .entry(key)
            .or_insert_with(|| Histogram::new(default_duration_buckets()))
            .observe(value);
    }

    /// `(count, sum)` of one histogram series.
    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> Option<(u64, f64)> {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.histograms)
            .get(&key)
            .map(|h| (h.count(), h.sum()))
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format, families sorted by name.
    pub fn export_prometheus(&self) -> String {
        let help = read(&self.help);
        let mut out = String::new();
        let header = |out: &mut String, name: &str, kind: &str| {
            if let Some(text) = help.get(name) {
                out.push_str(&format!("# HELP {name} {text}\n"));
            }
            out.push_str(&format!("# TYPE {name} {kind}\n"));
        };

        {
            let map = read(&self.counters);
            let mut series: Vec<_> = map.iter().collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            let mut last: Option<&str> = None;
            for ((name, labels), value) in series {
                if last != Some(name.as_str()) {
                    header(&mut out, name, "counter");
                    last = Some(name.as_str());
                }
                out.push_str(&format!(
                    "{name}{} {}\n",
                    labels.prometheus_str(),
                    value.load(Ordering::Relaxed)
                ));
            }
        }

        {
            let map = read(&self.gauges);
            let mut series: Vec<_> = map.iter().collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            let mut last: Option<&str> = None;
            for ((name, labels), value) in series {
                if last != Some(name.as_str()) {
                    header(&mut out, name, "gauge");
                    last = Some(name.as_str());
                }
                out.push_str(&format!("{name}{} {}\n", labels.prometheus_str(), value.load()));
            }
        }

        {
            let map = read(&self.histograms);
            let mut series: Vec<_> = map.iter().collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            let mut last: Option<&str> = None;
            for ((name, labels), h) in series {
                if last != Some(name.as_str()) {
                    header(&mut out, name, "histogram");
                    last = Some(name.as_str());
                }
                for (bound, count) in h.cumulative() {
                    out.push_str(&format!(
                        "{name}_bucket{} {count}\n",
                        labels.with_extra("le", &bound.to_string())
                    ));
                }
                out.push_str(&format!(
                    "{name}_bucket{} {}\n",
                    labels.with_extra("le", "+Inf"),
                    h.count()
                ));
                out.push_str(&format!("{name}_sum{} {}\n", labels.prometheus_str(), h.sum()));
                out.push_str(&format!(
                    "{name}_count{} {}\n",
                    labels.prometheus_str(),
                    h.count()
                ));
            }
        }

        out
    }

    /// Flat JSON snapshot keyed by `name{labels}`.
    pub fn export_json(&self) -> serde_json::Value {
        let key = |name: &str, labels: &Labels| format!("{name}{}", labels.prometheus_str());

        let counters: serde_json::Map<_, _> = read(&self.counters)
            .iter()
            .map(|((n, l), v)| (key(n, l), serde_json::json!(v.load(Ordering::Relaxed))))
            .collect();
        let gauges: serde_json::Map<_, _> = read(&self.gauges)
            .iter()
            .map(|((n, l), v)| (key(n, l), serde_json::json!(v.load())))
            .collect();
        let histograms: serde_json::Map<_, _> = read(&self.histograms)
            .iter()
            .map(|((n, l), h)| {
                (
                    key(n, l),
                    serde_json::json!({"count": h.count(), "sum": h.sum()}),
                )
            })
            .collect();

        serde_json::json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

pub fn global_metrics() -> &'static MetricsCollector {
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::with_defaults)
}

// ---------------------------------------------------------------------------
// Domain helpers
// ---------------------------------------------------------------------------

/// Thin wrappers so call sites don't repeat metric names and label keys.
pub struct PlatformMetrics;

impl PlatformMetrics {
    pub fn task_finished(language: &str, state: &str, iterations: u32) {
        let m = global_metrics();
        m.increment_counter("cs_tasks_total", &[("language", language), ("state", state)]);
        m.record_histogram(
            "cs_task_iterations",
            &[("language", language)],
            f64::from(iterations),
        );
    }

    pub fn llm_call(model: &str, success: bool, seconds: f64, tokens: u64) {
        let m = global_metrics();
        let result = if success { "ok" } else { "error" };
        m.increment_counter("cs_llm_requests_total", &[("model", model), ("result", result)]);
        m.record_histogram("cs_llm_request_duration_seconds", &[("model", model)], seconds);
        if tokens > 0 {
            m.increment_counter_by("cs_llm_tokens_total", &[("model", model)], tokens);
        }
    }

    pub fn container_op(op: &str, success: bool) {
        let result = if success { "ok" } else { "error" };
        global_metrics().increment_counter("cs_container_ops_total", &[("op", op), ("result", result)]);
    }

    pub fn live_containers(count: usize) {
        global_metrics().set_gauge("cs_containers_live", &[], count as f64);
    }

    pub fn autoscale_action(action: &str) {
        global_metrics().increment_counter("cs_autoscale_actions_total", &[("action", action)]);
    }

    pub fn squad_slots(capacity: usize) {
        global_metrics().set_gauge("cs_squad_slots", &[], capacity as f64);
    }

    pub fn bus_message(kind: &str) {
        global_metrics().increment_counter("cs_bus_messages_total", &[("kind", kind)]);
    }

    pub fn bus_dropped(kind: &str) {
        global_metrics().increment_counter("cs_bus_dropped_total", &[("kind", kind)]);
    }

    pub fn split_run(success: bool) {
        let result = if success { "ok" } else { "error" };
        global_metrics().increment_counter("cs_split_runs_total", &[("result", result)]);
    }

    pub fn escalation(step: &str) {
        global_metrics().increment_counter("cs_escalations_total", &[("step", step)]);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
