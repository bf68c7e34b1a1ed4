use once_cell::sync::{Lazy, OnceCell};
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::default);
static SERVICE_NAME: OnceCell<&'static str> = OnceCell::new();
static PROCESS_START: OnceCell<Instant> = OnceCell::new();

pub(crate) fn init(service: &str) {
    if SERVICE_NAME.get().is_some() {
        return;
    }

    let leaked: &'static str = Box::leak(service.to_string().into_boxed_str());
    SERVICE_NAME.set(leaked).ok();
    PROCESS_START.get_or_init(Instant::now);

    http_requests_total().ensure(&[leaked, "/metrics", "200"]);
    handler_latency_seconds().ensure(&[leaked, "/metrics"]);
}

pub fn service_name() -> Option<&'static str> {
    SERVICE_NAME.get().copied()
}

/// A metric family that can render itself in Prometheus text format.
trait Encode: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, out: &mut String) -> fmt::Result;
}

#[derive(Default)]
struct Registry {
    families: RwLock<Vec<Arc<dyn Encode>>>,
}

impl Registry {
    fn register(&self, family: Arc<dyn Encode>) {
        let mut guard = self
            .families
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.iter().all(|existing| existing.name() != family.name()) {
            guard.push(family);
        }
    }

    fn encode(&self) -> Result<String, fmt::Error> {
        let mut output = String::new();
        let guard = self.families.read().unwrap_or_else(PoisonError::into_inner);
        for family in guard.iter() {
            family.encode(&mut output)?;
        }
        Ok(output)
    }
}

/// Labelled children of one metric, kept sorted by label values.
struct Family<T> {
    name: &'static str,
    help: &'static str,
    kind: &'static str,
    label_names: &'static [&'static str],
    children: Mutex<BTreeMap<Vec<String>, Arc<T>>>,
}

impl<T> Family<T> {
    fn new(
        name: &'static str,
        help: &'static str,
        kind: &'static str,
        label_names: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            help,
            kind,
            label_names,
            children: Mutex::new(BTreeMap::new()),
        }
    }

    fn child(&self, label_values: &[&str], make: impl FnOnce() -> T) -> Arc<T> {
        debug_assert_eq!(
            self.label_names.len(),
            label_values.len(),
            "label value count mismatch for {}",
            self.name
        );
        let key: Vec<String> = label_values.iter().map(|value| value.to_string()).collect();
        let mut guard = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(guard.entry(key).or_insert_with(|| Arc::new(make())))
    }

    fn snapshot(&self) -> Vec<(Vec<String>, Arc<T>)> {
        let guard = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .iter()
            .map(|(labels, child)| (labels.clone(), Arc::clone(child)))
            .collect()
    }

    fn write_header(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "# HELP {} {}", self.name, self.help)?;
        writeln!(out, "# TYPE {} {}", self.name, self.kind)
    }
}

#[derive(Default)]
struct CounterValue(AtomicU64);

impl Encode for Family<CounterValue> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn encode(&self, out: &mut String) -> fmt::Result {
        self.write_header(out)?;
        for (labels, value) in self.snapshot() {
            write!(out, "{}", self.name)?;
            write_labels(out, self.label_names, &labels, None)?;
            writeln!(out, " {}", value.0.load(Ordering::Relaxed))?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct CounterVec {
    family: Arc<Family<CounterValue>>,
}

impl CounterVec {
    pub fn inc(&self, labels: &[&str], amount: u64) {
        self.family
            .child(labels, CounterValue::default)
            .0
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn ensure(&self, labels: &[&str]) {
        let _ = self.family.child(labels, CounterValue::default);
    }

    pub fn get(&self, labels: &[&str]) -> u64 {
        self.family
            .child(labels, CounterValue::default)
            .0
            .load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct GaugeValue(AtomicU64);

impl Encode for Family<GaugeValue> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn encode(&self, out: &mut String) -> fmt::Result {
        self.write_header(out)?;
        for (labels, value) in self.snapshot() {
            write!(out, "{}", self.name)?;
            write_labels(out, self.label_names, &labels, None)?;
            let current = f64::from_bits(value.0.load(Ordering::Relaxed));
            writeln!(out, " {}", format_float(current))?;
        }
        Ok(())
    }
}

struct HistogramValue {
    state: Mutex<HistogramState>,
}

struct HistogramState {
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl HistogramValue {
    fn new(bucket_count: usize) -> Self {
        Self {
            state: Mutex::new(HistogramState {
                counts: vec![0; bucket_count + 1],
                sum: 0.0,
                count: 0,
            }),
        }
    }
}

struct HistogramFamily {
    family: Family<HistogramValue>,
    buckets: &'static [f64],
}

impl Encode for HistogramFamily {
    fn name(&self) -> &'static str {
        self.family.name
    }

    fn encode(&self, out: &mut String) -> fmt::Result {
        let name = self.family.name;
        self.family.write_header(out)?;
        for (labels, value) in self.family.snapshot() {
            let (counts, sum, count) = {
                let state = value.state.lock().unwrap_or_else(PoisonError::into_inner);
                (state.counts.clone(), state.sum, state.count)
            };

            let mut cumulative = 0;
            for (idx, bound) in self.buckets.iter().enumerate() {
                cumulative += counts.get(idx).copied().unwrap_or(0);
                write!(out, "{name}_bucket")?;
                write_labels(out, self.family.label_names, &labels, Some(&format_float(*bound)))?;
                writeln!(out, " {cumulative}")?;
            }
            write!(out, "{name}_bucket")?;
            write_labels(out, self.family.label_names, &labels, Some("+Inf"))?;
            writeln!(out, " {count}")?;

            write!(out, "{name}_sum")?;
            write_labels(out, self.family.label_names, &labels, None)?;
            writeln!(out, " {}", format_float(sum))?;

            write!(out, "{name}_count")?;
            write_labels(out, self.family.label_names, &labels, None)?;
            writeln!(out, " {count}")?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct HistogramVec {
    inner: Arc<HistogramFamily>,
}

impl HistogramVec {
    pub fn observe(&self, labels: &[&str], value: f64) {
        let buckets = self.inner.buckets;
        let child = self
            .inner
            .family
            .child(labels, || HistogramValue::new(buckets.len()));
        let mut state = child.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.count += 1;
        state.sum += value;
        let idx = buckets
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(buckets.len());
        if let Some(slot) = state.counts.get_mut(idx) {
            *slot += 1;
        }
    }

    pub fn ensure(&self, labels: &[&str]) {
        let buckets = self.inner.buckets;
        let _ = self
            .inner
            .family
            .child(labels, || HistogramValue::new(buckets.len()));
    }
}

fn write_labels(
    out: &mut String,
    names: &[&str],
    values: &[String],
    le: Option<&str>,
) -> fmt::Result {
    if names.is_empty() && le.is_none() {
        return Ok(());
    }

    out.push('{');
    let mut first = true;
    let pairs = names
        .iter()
        .copied()
        .zip(values.iter().map(String::as_str))
        .chain(le.map(|bound| ("le", bound)));
    for (name, value) in pairs {
        if !first {
            out.push(',');
        }
        first = false;
        write!(out, r#"{}="{}""#, name, escape_label_value(value))?;
    }
    out.push('}');
    Ok(())
}

fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn format_float(value: f64) -> String {
    let mut formatted = format!("{value:.6}");
    while formatted.contains('.') && formatted.ends_with('0') {
        formatted.pop();
    }
    if formatted.ends_with('.') {
        formatted.push('0');
    }
    if formatted == "-0.0" {
        formatted = "0.0".to_string();
    }
    formatted
}

pub fn register_counter(
    name: &'static str,
    help: &'static str,
    label_names: &'static [&'static str],
) -> CounterVec {
    let family = Arc::new(Family::new(name, help, "counter", label_names));
    REGISTRY.register(family.clone());
    CounterVec { family }
}

pub fn register_histogram(
    name: &'static str,
    help: &'static str,
    label_names: &'static [&'static str],
    buckets: &'static [f64],
) -> HistogramVec {
    let inner = Arc::new(HistogramFamily {
        family: Family::new(name, help, "histogram", label_names),
        buckets,
    });
    REGISTRY.register(inner.clone());
    HistogramVec { inner }
}

pub fn encode_prometheus() -> String {
    if let (Some(service), Some(start)) = (service_name(), PROCESS_START.get()) {
        let uptime = PROCESS_UPTIME_SECONDS.child(&[service], GaugeValue::default);
        uptime
            .0
            .store(start.elapsed().as_secs_f64().to_bits(), Ordering::Relaxed);
    }

    REGISTRY.encode().unwrap_or_else(|error| {
        tracing::warn!(%error, "failed to encode metrics");
        String::new()
    })
}

static PROCESS_UPTIME_SECONDS: Lazy<Arc<Family<GaugeValue>>> = Lazy::new(|| {
    let family = Arc::new(Family::new(
        "process_uptime_seconds",
        "Process uptime in seconds",
        "gauge",
        &["service"],
    ));
    REGISTRY.register(family.clone());
    family
});

static HTTP_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter(
        "http_requests_total",
        "Total HTTP requests received",
        &["service", "route", "code"],
    )
});

static HANDLER_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram(
        "http_handler_latency_seconds",
        "HTTP handler latency in seconds",
        &["service", "route"],
        LATENCY_BUCKETS,
    )
});

static AUTH_ATTEMPTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter(
        "auth_attempts_total",
        "Login attempts by outcome",
        &["outcome"],
    )
});

static SESSION_VALIDATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter(
        "session_validations_total",
        "Session token validations by outcome",
        &["outcome"],
    )
});

pub fn http_requests_total() -> &'static CounterVec {
    &HTTP_REQUESTS_TOTAL
}

pub fn handler_latency_seconds() -> &'static HistogramVec {
    &HANDLER_LATENCY_SECONDS
}

pub fn auth_attempts_total() -> &'static CounterVec {
    &AUTH_ATTEMPTS_TOTAL
}

pub fn session_validations_total() -> &'static CounterVec {
    &SESSION_VALIDATIONS_TOTAL
}
