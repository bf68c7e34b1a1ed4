//! JSON logging, request context, and metrics shared by every storefront
//! service.
//!
//! A service calls [`ObsInit::init_with_log_file`] once at start and keeps
//! the returned [`ObsGuard`] alive until shutdown. Nothing else in the
//! workspace holds a logger handle: components emit `tracing` events and the
//! installed subscriber decides where they go.

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};

use serde_json::{json, Map, Number, Value};
use tracing::{field::Visit, span};
use tracing_subscriber::{
    fmt::{self as tsfmt, format::Writer, FmtContext, FormatEvent, FormatFields, MakeWriter},
    layer::{Context, Layer, SubscriberExt},
    registry::{LookupSpan, SpanRef},
    EnvFilter, Registry,
};

mod http;
mod metrics;

pub use http::{
    health_router, metrics_router, request_context, shutdown_signal, track_http_metrics,
    REQUEST_ID_HEADER,
};
pub use metrics::{auth_attempts_total, session_validations_total, CounterVec};

#[derive(Debug, thiserror::Error)]
pub enum ObsInitError {
    #[error("tracing subscriber already initialized")]
    AlreadyInitialized,
    #[error("failed to install tracing subscriber: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Initialize observability for a service.
pub struct ObsInit;

impl ObsInit {
    /// Install a global tracing subscriber writing JSON lines to stderr and,
    /// when `log_file` is given, appending the same lines to that file.
    pub fn init_with_log_file(
        service: &str,
        log_file: Option<&Path>,
    ) -> Result<ObsGuard, ObsInitError> {
        let sink = match log_file {
            Some(path) => LogSink::open(path)?,
            None => LogSink::stderr(),
        };
        let guard = ObsGuard {
            service: Arc::from(service),
            file: sink.file.clone(),
        };

        let subscriber = Self::subscriber_with_writer(service, sink);
        tracing::subscriber::set_global_default(subscriber).map_err(|err| {
            if tracing::dispatcher::has_been_set() {
                ObsInitError::AlreadyInitialized
            } else {
                ObsInitError::Install(err)
            }
        })?;

        Ok(guard)
    }

    /// Build a tracing subscriber using the provided writer.
    pub fn subscriber_with_writer<W>(service: &str, writer: W) -> impl tracing::Subscriber
    where
        W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
    {
        metrics::init(service);
        let env_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(env_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let fmt_layer = tsfmt::layer()
            .with_ansi(false)
            .event_format(ObsJsonFormat {
                service: Arc::from(service),
            })
            .with_writer(writer);

        Registry::default()
            .with(env_filter)
            .with(TraceLayer::default())
            .with(fmt_layer)
    }
}

/// Keeps the service's log output open; dropping it logs `service_stop` and
/// flushes the log file to disk.
#[must_use = "dropping the guard ends the logging lifecycle"]
pub struct ObsGuard {
    service: Arc<str>,
    file: Option<Arc<Mutex<File>>>,
}

impl Drop for ObsGuard {
    fn drop(&mut self) {
        tracing::info!(event = "service_stop", service = %self.service);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
            let _ = file.sync_all();
        }
    }
}

/// Writer target for log lines: always stderr, optionally tee'd into a file.
#[derive(Clone, Default)]
pub struct LogSink {
    file: Option<Arc<Mutex<File>>>,
}

impl LogSink {
    pub fn stderr() -> Self {
        Self::default()
    }

    pub fn open(path: &Path) -> Result<Self, ObsInitError> {
        let log_file_error = |source| ObsInitError::LogFile {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(log_file_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(log_file_error)?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
        })
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            file: self.file.clone(),
        }
    }
}

pub struct SinkWriter {
    file: Option<Arc<Mutex<File>>>,
}

impl io::Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = &self.file {
            file.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = &self.file {
            file.lock().unwrap_or_else(PoisonError::into_inner).flush()?;
        }
        Ok(())
    }
}

/// Helper trait for request scoped metadata.
pub trait SpanExt {
    /// Record a request identifier on the span so that subsequent logs emit it.
    fn with_req(&self, request_id: &str);

    /// Retrieve the active trace identifier for the span.
    fn trace_id(&self) -> Option<String>;
}

impl SpanExt for tracing::Span {
    fn with_req(&self, request_id: &str) {
        if let Some(ctx) = trace_context(self) {
            ctx.set_request_id(request_id);
        }
    }

    fn trace_id(&self) -> Option<String> {
        trace_context(self).map(|ctx| ctx.trace_id.clone())
    }
}

fn trace_context(span: &tracing::Span) -> Option<Arc<TraceContext>> {
    span.with_subscriber(|(id, dispatch)| {
        let registry = dispatch.downcast_ref::<Registry>()?;
        let span = registry.span(id)?;
        let ctx = span.extensions().get::<Arc<TraceContext>>().cloned();
        ctx
    })
    .flatten()
}

/// Assigns a trace id to every root span; child spans inherit their parent's.
#[derive(Default)]
struct TraceLayer {
    counter: AtomicU64,
}

impl<S> Layer<S> for TraceLayer
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &span::Id,
        ctx: Context<'_, S>,
    ) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let inherited = span
            .parent()
            .and_then(|parent| parent.extensions().get::<Arc<TraceContext>>().cloned());
        let trace_ctx = inherited.unwrap_or_else(|| {
            let next = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
            Arc::new(TraceContext::new(format!("{next:016x}")))
        });
        span.extensions_mut().insert(trace_ctx);
    }
}

struct TraceContext {
    trace_id: String,
    request_id: RwLock<Option<String>>,
}

impl TraceContext {
    fn new(trace_id: String) -> Self {
        Self {
            trace_id,
            request_id: RwLock::new(None),
        }
    }

    fn request_id(&self) -> Option<String> {
        self.request_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_request_id(&self, value: &str) {
        *self
            .request_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(value.to_string());
    }
}

struct ObsJsonFormat {
    service: Arc<str>,
}

impl<S, N> FormatEvent<S, N> for ObsJsonFormat
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let trace = ctx.lookup_current().and_then(find_trace_ctx);
        let line = json!({
            "level": metadata.level().as_str().to_ascii_lowercase(),
            "target": metadata.target(),
            "service": &*self.service,
            "trace_id": trace.as_ref().map(|ctx| ctx.trace_id.clone()),
            "request_id": trace.as_ref().and_then(|ctx| ctx.request_id()),
            "fields": Value::Object(fields.0),
        });
        writeln!(writer, "{line}")
    }
}

fn find_trace_ctx<S>(span: SpanRef<'_, S>) -> Option<Arc<TraceContext>>
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    span.scope()
        .from_root()
        .find_map(|scope_span| scope_span.extensions().get::<Arc<TraceContext>>().cloned())
}

#[derive(Default)]
struct FieldCollector(Map<String, Value>);

impl FieldCollector {
    fn insert(&mut self, field: &tracing::field::Field, value: Value) {
        self.0.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.insert(field, Value::String(value.to_string()));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.insert(
            field,
            Number::from_f64(value).map_or(Value::Null, Value::Number),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tracing::subscriber::with_default;

    #[derive(Clone)]
    struct TestMakeWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for TestMakeWriter {
        type Writer = TestWriter;

        fn make_writer(&'a self) -> Self::Writer {
            TestWriter(self.0.clone())
        }
    }

    struct TestWriter(Arc<Mutex<Vec<u8>>>);

    impl io::Write for TestWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn captured(buffer: &Arc<Mutex<Vec<u8>>>) -> String {
        String::from_utf8(buffer.lock().unwrap().clone()).expect("valid utf8")
    }

    #[test]
    fn json_logs_include_trace_and_request() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = ObsInit::subscriber_with_writer("svc", TestMakeWriter(buffer.clone()));

        with_default(subscriber, || {
            let span = tracing::info_span!("request_span");
            let _guard = span.enter();
            span.with_req("req-123");
            assert!(span.trace_id().is_some());
            tracing::info!(message = "hello world", attempts = 3u64);
        });

        let output = captured(&buffer);
        let line: Value = serde_json::from_str(output.trim()).expect("one json line");
        assert_eq!(line["service"], "svc");
        assert_eq!(line["level"], "info");
        assert_eq!(line["request_id"], "req-123");
        assert!(line["trace_id"].is_string());
        assert_eq!(line["fields"]["message"], "hello world");
        assert_eq!(line["fields"]["attempts"], 3);
    }

    #[test]
    fn child_spans_share_the_root_trace_id() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = ObsInit::subscriber_with_writer("svc", TestMakeWriter(buffer));

        with_default(subscriber, || {
            let root = tracing::info_span!("root");
            let child = tracing::info_span!(parent: &root, "child");
            let other = tracing::info_span!("other");
            assert_eq!(root.trace_id(), child.trace_id());
            assert_ne!(root.trace_id(), other.trace_id());
        });
    }

    #[test]
    fn events_outside_spans_have_null_trace() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = ObsInit::subscriber_with_writer("svc", TestMakeWriter(buffer.clone()));

        with_default(subscriber, || tracing::warn!("bare \"quoted\" event"));

        let line: Value = serde_json::from_str(captured(&buffer).trim()).unwrap();
        assert!(line["trace_id"].is_null());
        assert!(line["request_id"].is_null());
        assert_eq!(line["fields"]["message"], "bare \"quoted\" event");
    }

    #[test]
    fn log_sink_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("svc.log");
        let sink = LogSink::open(&path).expect("open log file");
        let subscriber = ObsInit::subscriber_with_writer("svc", sink);

        with_default(subscriber, || tracing::info!(user = "alice", "logged in"));

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"user\":\"alice\""));
        assert!(contents.ends_with('\n'));
    }
}
