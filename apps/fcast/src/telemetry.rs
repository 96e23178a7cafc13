// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    trace::{self as sdktrace, SdkTracerProvider},
    Resource,
};
use std::time::Duration;
use tracing_opentelemetry::OpenTelemetryLayer;

use crate::config::TelemetryConfig;

fn service_resource() -> Resource {
    Resource::builder_empty()
        .with_attributes([
            opentelemetry::KeyValue::new("service.name", "fcast"),
            opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build()
}

/// Build OTLP metrics exporter with optional custom headers.
fn build_otlp_exporter(
    endpoint: &str,
    headers: &std::collections::HashMap<String, String>,
) -> Result<opentelemetry_otlp::MetricExporter, Box<dyn std::error::Error>> {
    let mut exporter_builder = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10));

    if !headers.is_empty() {
        tracing::info!("Adding {} custom headers to OTLP exporter", headers.len());
        exporter_builder = exporter_builder.with_headers(headers.clone());
    }

    exporter_builder.build().map_err(|e| {
        tracing::error!("Failed to build OTLP metrics exporter: {}", e);
        e.into()
    })
}

fn build_otlp_span_exporter(
    endpoint: &str,
    headers: &std::collections::HashMap<String, String>,
) -> Result<opentelemetry_otlp::SpanExporter, Box<dyn std::error::Error>> {
    let mut exporter_builder = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10));

    if !headers.is_empty() {
        tracing::info!("Adding {} custom headers to OTLP trace exporter", headers.len());
        exporter_builder = exporter_builder.with_headers(headers.clone());
    }

    exporter_builder.build().map_err(|e| {
        tracing::error!("Failed to build OTLP trace exporter: {}", e);
        e.into()
    })
}

/// Initializes the OpenTelemetry metrics provider with optional OTLP export.
///
/// Without an endpoint, metrics are still collected locally so instruments
/// stay cheap no-ops instead of panicking.
///
/// # Errors
///
/// Returns an error if the OTLP exporter fails to build.
pub fn init_metrics(
    config: &TelemetryConfig,
) -> Result<SdkMeterProvider, Box<dyn std::error::Error>> {
    let builder = SdkMeterProvider::builder().with_resource(service_resource());

    let provider = if let Some(endpoint) = &config.otlp_endpoint {
        tracing::info!(endpoint = %endpoint, "Configuring OTLP metrics exporter");
        let exporter = build_otlp_exporter(endpoint, &config.otlp_headers)?;
        let reader =
            PeriodicReader::builder(exporter).with_interval(Duration::from_secs(5)).build();
        builder.with_reader(reader).build()
    } else {
        tracing::info!("No OTLP endpoint configured, metrics will be collected but not exported");
        builder.build()
    };

    global::set_meter_provider(provider.clone());
    Ok(provider)
}

/// Builds a tracing layer that exports spans over OTLP.
///
/// # Errors
///
/// Returns an error when no traces endpoint is configured or the exporter
/// fails to build.
pub fn init_tracing_with_otlp<S>(
    config: &TelemetryConfig,
) -> Result<OpenTelemetryLayer<S, sdktrace::Tracer>, Box<dyn std::error::Error>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let endpoint = config.otlp_traces_endpoint.as_ref().ok_or_else(|| {
        "Tracing is enabled but no `otlp_traces_endpoint` is configured".to_string()
    })?;

    tracing::info!(endpoint = %endpoint, "Configuring OTLP trace exporter");
    let exporter = build_otlp_span_exporter(endpoint, &config.otlp_headers)?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(service_resource())
        .build();

    let tracer = provider.tracer("fcast");
    global::set_tracer_provider(provider);

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}
