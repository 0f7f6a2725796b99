//! Log output and OpenTelemetry export
//!
//! Stream spans opened by the proxy's `LogTracer` are ordinary `tracing`
//! spans, so with OTLP enabled they are exported alongside everything else.

use anyhow::{Context, Result};
use config::TelemetryConfig;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{Sampler, TracerProvider as SdkTracerProvider},
    Resource,
};
use tracing::{info, Level};
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, FmtSubscriber, Layer};

/// Parse a log level name, falling back to info
pub fn parse_level(name: &str) -> Level {
    match name.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber, with an OTLP layer when telemetry is enabled
///
/// Must run inside a tokio runtime; the batch exporter spawns onto it.
pub fn init_tracing(level: Level, config: &TelemetryConfig) -> Result<Option<SdkTracerProvider>> {
    let provider = if config.enabled {
        build_provider(config)
    } else {
        None
    };

    match &provider {
        Some(provider) => {
            let tracer = provider.tracer("conduit");
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_filter(LevelFilter::from_level(level)),
                )
                .with(
                    tracing_opentelemetry::layer()
                        .with_tracer(tracer)
                        .with_filter(LevelFilter::from_level(level)),
                )
                .try_init()
                .context("Failed to set tracing subscriber")?;
            info!(endpoint = %config.otlp_endpoint, "OpenTelemetry export enabled");
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set tracing subscriber")?;
        }
    }

    Ok(provider)
}

fn build_provider(config: &TelemetryConfig) -> Option<SdkTracerProvider> {
    let sampler = if config.sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if config.sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(config.sampling_ratio)
    };

    let trace_config = opentelemetry_sdk::trace::Config::default()
        .with_sampler(sampler)
        .with_resource(Resource::new(vec![opentelemetry::KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]));

    match opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&config.otlp_endpoint),
        )
        .with_trace_config(trace_config)
        .install_batch(opentelemetry_sdk::runtime::Tokio)
    {
        Ok(provider) => Some(provider),
        Err(e) => {
            // No subscriber yet, so this goes to stderr
            eprintln!("Failed to create OTLP tracer provider: {e}");
            None
        }
    }
}

/// Flush pending spans
pub fn shutdown_telemetry(provider: Option<SdkTracerProvider>) {
    if let Some(provider) = provider {
        info!("Shutting down OpenTelemetry export");
        if let Err(e) = provider.shutdown() {
            tracing::error!(error = %e, "Error shutting down tracer provider");
        }
    }
}
