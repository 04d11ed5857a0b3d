//! # Telemetry
//!
//! Console logging through `tracing_subscriber::fmt` is always on and filtered
//! with `RUST_LOG` (default `info`). OpenTelemetry export is opt-in.
//!
//! ## Feature matrix
//!
//! - `tracing`: Export spans (HTTP requests, dispatch) through OpenTelemetry.
//! - `metrics`: Export admission and dispatch counters and histograms.
//! - `stdout`: Use the stdout exporter for whichever of the above is enabled.
//!
//! Without `metrics`, every `increment_*`/`record_*` helper below compiles to
//! a no-op.
//!
//! ## Example usage
//!
//! ```bash
//! cargo run -p coupon-server --features tracing,metrics,stdout
//! ```

// Disallow using `stdout` without `tracing` or `metrics`
#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

use coupon_core::types::IssuanceState;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

const SERVICE_NAME: &str = "coupon-server";

pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops the exporters. Errors are reported on stderr since
    /// the subscriber may already be gone.
    pub fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer();

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "tracing")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(&meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    builder.build()
}

#[cfg(feature = "tracing")]
fn init_tracer() -> sdktrace::SdkTracerProvider {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let exporter = SpanExporter::default();
        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    builder.build()
}

/// Instruments recorded by admission and dispatch.
#[cfg(feature = "metrics")]
struct IssuanceMetrics {
    admissions: Counter<u64>,
    overloads: Counter<u64>,
    outcomes: Counter<u64>,
    dispatch_ms: Histogram<f64>,
    queue_depth: Histogram<u64>,
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<IssuanceMetrics> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let _ = METRICS.set(IssuanceMetrics {
        admissions: meter
            .u64_counter("coupon.admissions")
            .with_description("Issuance requests that passed campaign checks")
            .build(),
        overloads: meter
            .u64_counter("coupon.overloads")
            .with_description("Issuance requests rejected because the queue was full")
            .build(),
        outcomes: meter
            .u64_counter("coupon.outcomes")
            .with_description("Requests reaching a terminal state, by state")
            .build(),
        dispatch_ms: meter
            .f64_histogram("coupon.dispatch.duration")
            .with_unit("ms")
            .with_description("Time from dequeue to terminal state")
            .build(),
        queue_depth: meter
            .u64_histogram("coupon.queue.depth")
            .with_description("Campaign queue depth observed at admission")
            .build(),
    });
}

#[cfg(feature = "metrics")]
pub fn increment_admissions() {
    if let Some(m) = METRICS.get() {
        m.admissions.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_admissions() {}

#[cfg(feature = "metrics")]
pub fn increment_overloads() {
    if let Some(m) = METRICS.get() {
        m.overloads.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_overloads() {}

/// Counts a terminal outcome, tagged with its state (`ISSUED`, `SOLD_OUT`,
/// `FAILED`).
#[cfg(feature = "metrics")]
pub fn record_outcome(state: IssuanceState) {
    if let Some(m) = METRICS.get() {
        m.outcomes.add(1, &[KeyValue::new("state", state.to_string())]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_outcome(_state: IssuanceState) {}

#[cfg(feature = "metrics")]
pub fn record_dispatch_duration(duration_ms: f64) {
    if let Some(m) = METRICS.get() {
        m.dispatch_ms.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_dispatch_duration(_duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn record_queue_depth(depth: usize) {
    if let Some(m) = METRICS.get() {
        m.queue_depth.record(depth as u64, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_queue_depth(_depth: usize) {}
