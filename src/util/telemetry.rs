use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{self, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::util::env::Config;

pub type Result<T> = core::result::Result<T, Box<dyn std::error::Error>>;

/// OTLP providers, present only when a collector endpoint is configured.
#[derive(Debug, Clone)]
struct Exporters {
    logger_provider: SdkLoggerProvider,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

#[derive(Debug, Clone)]
pub struct Telemetry {
    pub service_name: String,
    pub log_filter: String,
    pub json_logs: bool,

    exporters: Option<Exporters>,
}

impl Telemetry {
    pub fn new(config: &Config, json_logs: bool) -> Result<Telemetry> {
        let exporters = match config.otel_exporter_otlp_endpoint.as_deref() {
            Some(collector_url) => {
                let base_resource = base_attrs(&config.service_name, env!("CARGO_PKG_VERSION"));
                Some(Exporters {
                    logger_provider: build_logger_provider(collector_url, base_resource.clone())?,
                    tracer_provider: build_tracer_provider(collector_url, base_resource.clone())?,
                    meter_provider: build_meter_provider(collector_url, base_resource)?,
                })
            }
            None => None,
        };

        Ok(Self {
            service_name: config.service_name.clone(),
            log_filter: config.log_filter.clone(),
            json_logs,
            exporters,
        })
    }

    /// Installs the global subscriber: console output always, OTLP layers when configured.
    pub fn register(self) -> Self {
        let trace_layer = self.exporters.as_ref().map(|ex| {
            let tracer = ex.tracer_provider.tracer(self.service_name.clone());
            tracing_opentelemetry::layer().with_tracer(tracer)
        });
        let meter_layer = self
            .exporters
            .as_ref()
            .map(|ex| tracing_opentelemetry::MetricsLayer::new(ex.meter_provider.clone()));
        let log_layer = self
            .exporters
            .as_ref()
            .map(|ex| OpenTelemetryTracingBridge::new(&ex.logger_provider));

        let json_layer = self.json_logs.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
        });
        let text_layer = (!self.json_logs).then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
        });

        tracing_subscriber::registry()
            .with(EnvFilter::new(&self.log_filter))
            .with(json_layer)
            .with(text_layer)
            .with(trace_layer)
            .with(meter_layer)
            .with(log_layer)
            .init();

        tracing::debug!(
            service = %self.service_name,
            otlp = self.exporters.is_some(),
            "telemetry registered"
        );

        self
    }

    pub fn shutdown(self) {
        let Some(exporters) = self.exporters else {
            return;
        };

        if let Err(e) = exporters.meter_provider.shutdown() {
            eprintln!("error during metering shutdown: {e:?}");
        }

        if let Err(e) = exporters.logger_provider.shutdown() {
            eprintln!("error during logging shutdown: {e:?}");
        }

        if let Err(e) = exporters.tracer_provider.shutdown() {
            eprintln!("error during tracing shutdown: {e:?}");
        }
    }
}

pub fn build_logger_provider(
    collector_url: &str,
    base_resource: Resource,
) -> Result<SdkLoggerProvider> {
    let exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(Endpoint::Logs.to_url(collector_url))
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(base_resource)
        .build())
}

pub fn build_tracer_provider(
    collector_url: &str,
    base_resource: Resource,
) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(Endpoint::Traces.to_url(collector_url))
        .with_timeout(Duration::from_secs(5))
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(base_resource)
        .build();

    global::set_tracer_provider(provider.clone());

    Ok(provider)
}

pub fn build_meter_provider(
    collector_url: &str,
    base_resource: Resource,
) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(Endpoint::Metrics.to_url(collector_url))
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(base_resource)
        .build())
}

fn base_attrs(name: &str, version: &'static str) -> Resource {
    Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", name.to_string()),
            KeyValue::new("service.version", version),
        ])
        .build()
}

enum Endpoint {
    Logs,
    Traces,
    Metrics,
}

impl Endpoint {
    pub fn to_url(&self, collector_endpoint: &str) -> String {
        let location: &str = match self {
            Endpoint::Logs => "/v1/logs",
            Endpoint::Traces => "/v1/traces",
            Endpoint::Metrics => "/v1/metrics",
        };

        format!("{}{location}", collector_endpoint.trim_end_matches('/'))
    }
}
