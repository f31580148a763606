use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Result;
use opentelemetry::global;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider};
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub const LOG_FILE_PREFIX: &str = "portable.log";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `portable=debug,portable::plugin=info`.
    pub log_level: String,
    /// When set, a daily rolling text log is written here as well.
    pub log_dir: Option<PathBuf>,
    /// OTLP/HTTP endpoint for logs and metrics.
    pub otel_endpoint: Option<String>,
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>, otel_endpoint: Option<String>) -> Self {
        Self {
            log_level: log_level.into(),
            log_dir,
            otel_endpoint,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info", None, None)
    }
}

/// Keeps the file writer and the OTLP providers alive. Dropping it flushes
/// and shuts them down.
pub struct Telemetry {
    _file_guard: Option<WorkerGuard>,
    logger_provider: Option<SdkLoggerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = self.logger_provider.take() {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.meter_provider.take() {
            let _ = provider.shutdown();
        }
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name("portable").build())
        .clone()
}

fn init_logs(end_point: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(end_point: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

/// Install the global subscriber: stdout always, a rolling file when
/// `log_dir` is set, and the OTLP bridge plus meter provider when an
/// endpoint is configured. Without an endpoint the global meter stays a no-op.
pub fn init_tracing(conf: &LogConfig) -> Result<Telemetry> {
    let env_filter = EnvFilter::try_new(&conf.log_level)?;

    let fmt_layer = fmt::layer().with_thread_names(true);

    let (file_layer, file_guard) = match &conf.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let (otel_layer, logger_provider, meter_provider) = match conf.otel_endpoint.as_deref() {
        Some(endpoint) => {
            let logger_provider = init_logs(endpoint)?;
            let meter_provider = init_metrics(endpoint)?;
            global::set_meter_provider(meter_provider.clone());
            let filter = EnvFilter::new(&conf.log_level)
                .add_directive("hyper=off".parse()?)
                .add_directive("tonic=off".parse()?)
                .add_directive("h2=off".parse()?)
                .add_directive("reqwest=off".parse()?);
            let layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(filter);
            (Some(layer), Some(logger_provider), Some(meter_provider))
        }
        None => (None, None, None),
    };

    Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .with(file_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(Telemetry {
        _file_guard: file_guard,
        logger_provider,
        meter_provider,
    })
}
