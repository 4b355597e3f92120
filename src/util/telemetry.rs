use std::time::Duration;

use opentelemetry::{KeyValue, global};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::TelemetryConfig;

pub type Result<T> = core::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Owns the OTLP providers (when a collector is configured) so they can be flushed on exit.
#[derive(Debug)]
pub struct Telemetry {
    service_name: String,
    log_filter: String,
    exporters: Option<Exporters>,
}

#[derive(Debug)]
struct Exporters {
    logger_provider: SdkLoggerProvider,
    tracer_provider: SdkTracerProvider,
}

impl Telemetry {
    pub fn new(config: &TelemetryConfig) -> Result<Telemetry> {
        let exporters = match config.collector_url.as_deref() {
            Some(collector_url) => {
                let resource = base_attrs(&config.service_name, env!("CARGO_PKG_VERSION"));
                Some(Exporters {
                    logger_provider: build_logger_provider(collector_url, resource.clone())?,
                    tracer_provider: build_tracer_provider(collector_url, resource)?,
                })
            }
            None => None,
        };

        Ok(Self {
            service_name: config.service_name.clone(),
            log_filter: config.log_filter.clone(),
            exporters,
        })
    }

    /// Installs the global subscriber. `RUST_LOG` takes precedence over the configured filter.
    pub fn register(self) -> Self {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.log_filter));

        let trace_layer = self.exporters.as_ref().map(|exporters| {
            global::set_tracer_provider(exporters.tracer_provider.clone());
            tracing_opentelemetry::layer().with_tracer(global::tracer(self.service_name.clone()))
        });

        let log_layer = self
            .exporters
            .as_ref()
            .map(|exporters| OpenTelemetryTracingBridge::new(&exporters.logger_provider));

        tracing_subscriber::registry()
            .with(trace_layer)
            .with(log_layer)
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .init();

        if self.exporters.is_none() {
            tracing::debug!("no OTLP collector configured, logging to stdout only");
        }

        self
    }

    pub fn shutdown(self) {
        let Some(exporters) = self.exporters else {
            return;
        };

        if let Err(e) = exporters.logger_provider.shutdown() {
            eprintln!("error during logging shutdown: {e:?}");
        }

        if let Err(e) = exporters.tracer_provider.shutdown() {
            eprintln!("error during tracing shutdown: {e:?}");
        }
    }
}

fn build_logger_provider(collector_url: &str, resource: Resource) -> Result<SdkLoggerProvider> {
    let exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(Signal::Logs.to_url(collector_url))
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn build_tracer_provider(collector_url: &str, resource: Resource) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(Signal::Traces.to_url(collector_url))
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn base_attrs(name: &str, version: &'static str) -> Resource {
    Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", name.to_owned()),
            KeyValue::new("service.version", version),
        ])
        .build()
}

enum Signal {
    Logs,
    Traces,
}

impl Signal {
    fn to_url(&self, collector_url: &str) -> String {
        let path = match self {
            Signal::Logs => "/v1/logs",
            Signal::Traces => "/v1/traces",
        };
        format!("{}{path}", collector_url.trim_end_matches('/'))
    }
}
