use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use opentelemetry::KeyValue;
use opentelemetry::trace::{Span, TraceContextExt, Tracer, TracerProvider as OtelTracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{
    BatchConfigBuilder, BatchSpanProcessor, SdkTracerProvider, SpanExporter,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Telemetry handle for OpenTelemetry tracing.
pub(crate) struct Telemetry {
    tracer: opentelemetry_sdk::trace::SdkTracer,
    provider: SdkTracerProvider,
}

impl Telemetry {
    /// Initialize telemetry with an OTLP HTTP exporter.
    pub(crate) fn new(endpoint: &str) -> Result<Self> {
        let endpoint = normalize_otlp_http_trace_endpoint(endpoint)?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("build OTLP span exporter")?;
        Self::from_exporter(exporter)
    }

    pub(crate) fn in_span<T, F>(&self, name: &str, attributes: &[KeyValue], f: F) -> T
    where
        F: FnOnce() -> T,
    {
        self.tracer.in_span(name.to_string(), |cx| {
            let span = cx.span();
            for attribute in attributes {
                span.set_attribute(attribute.clone());
            }
            f()
        })
    }

    /// Flush spans and shut down the tracer provider.
    pub(crate) fn shutdown(&self) -> Result<()> {
        if let Err(err) = self.provider.shutdown() {
            return Err(anyhow!("failed to shutdown tracer provider: {err}"));
        }
        Ok(())
    }

    fn from_exporter<E: SpanExporter + 'static>(exporter: E) -> Result<Self> {
        let resource = Resource::builder().with_service_name("jcallgraph").build();
        // Spans are also ended on rayon workers while jars are parsed; the batch
        // processor only does a channel send there.
        let batch_config = BatchConfigBuilder::default()
            .with_max_queue_size(8192)
            .with_max_export_batch_size(1024)
            .with_scheduled_delay(Duration::from_millis(200))
            .build();
        let processor = BatchSpanProcessor::builder(exporter)
            .with_batch_config(batch_config)
            .build();
        let provider = SdkTracerProvider::builder()
            .with_resource(resource)
            .with_span_processor(processor)
            .build();
        let tracer = provider.tracer("jcallgraph");
        opentelemetry::global::set_tracer_provider(provider.clone());
        Ok(Self { tracer, provider })
    }
}

fn normalize_otlp_http_trace_endpoint(endpoint: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(endpoint).context("parse OTLP endpoint")?;
    let path = url.path().to_string();
    if path == "/" {
        url.set_path("/v1/traces");
    } else if let Some(prefix) = path.strip_suffix("/v1/logs") {
        url.set_path(&format!("{prefix}/v1/traces"));
    }
    Ok(url.to_string())
}

/// Initialize the logging facade with stderr output. `RUST_LOG` overrides the
/// default filter; `quiet` keeps only errors.
pub(crate) fn init_logging(quiet: bool) {
    let default_filter = if quiet { "error" } else { "jcallgraph=info,warn" };
    let init_result = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
    let _ = init_result;
}

/// Optional telemetry span helper.
pub(crate) fn with_span<T, F>(
    telemetry: Option<&Telemetry>,
    name: &str,
    attributes: &[KeyValue],
    f: F,
) -> T
where
    F: FnOnce() -> T,
{
    match telemetry {
        Some(telemetry) => telemetry.in_span(name, attributes, f),
        None => f(),
    }
}

/// Stages of one analysis run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Phase {
    Load,
    Hierarchy,
    CallGraph,
    Serialize,
}

impl Phase {
    fn span_name(self) -> &'static str {
        match self {
            Phase::Load => "phase.load",
            Phase::Hierarchy => "phase.hierarchy",
            Phase::CallGraph => "phase.callgraph",
            Phase::Serialize => "phase.serialize",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Phase::Load => "load_ms",
            Phase::Hierarchy => "hierarchy_ms",
            Phase::CallGraph => "callgraph_ms",
            Phase::Serialize => "serialize_ms",
        }
    }
}

/// Wall-clock durations of the phases run so far.
pub(crate) struct PhaseTimings<'t> {
    telemetry: Option<&'t Telemetry>,
    started_at: Instant,
    recorded: Vec<(Phase, Duration)>,
}

impl<'t> PhaseTimings<'t> {
    pub(crate) fn new(telemetry: Option<&'t Telemetry>) -> Self {
        Self {
            telemetry,
            started_at: Instant::now(),
            recorded: Vec::new(),
        }
    }

    /// Run `f` as `phase`, inside a span when telemetry is enabled.
    pub(crate) fn measure<T, F>(&mut self, phase: Phase, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let started_at = Instant::now();
        let result = with_span(self.telemetry, phase.span_name(), &[], f);
        self.recorded.push((phase, started_at.elapsed()));
        result
    }
}

impl fmt::Display for PhaseTimings<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "total_ms={}", self.started_at.elapsed().as_millis())?;
        for (phase, duration) in &self.recorded {
            write!(f, " {}={}", phase.label(), duration.as_millis())?;
        }
        Ok(())
    }
}
