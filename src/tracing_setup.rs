use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::core::api::Api;

/// `RUST_LOG` when set, else `fallback`.
fn env_filter_or(fallback: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => {
            EnvFilter::try_new(fallback).wrap_err_with(|| format!("Invalid log level: {fallback}"))
        }
    }
}

/// Initialize structured logging with JSON output
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(env_filter_or("info")?)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!("structured logging initialized");
    Ok(())
}

/// Initialize console-friendly logging for development
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(env_filter_or("info")?)
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!("console logging initialized");
    Ok(())
}

/// Initialize tracing from the `[logging]` section. `RUST_LOG` wins over `level`.
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter = env_filter_or(level)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    }
    .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!(level, json = json_format, "logging initialized");
    Ok(())
}

/// Configure tracing for specific service components
pub fn configure_component_tracing(component: &str) -> tracing::Span {
    tracing::info_span!("component", name = component)
}

/// Span for one inbound gateway request
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        api.name = tracing::field::Empty,
        http.status_code = tracing::field::Empty,
    )
}

/// Span for one controller step against the gateway driver
pub fn create_reconcile_span(operation: &str, api: &Api) -> tracing::Span {
    tracing::info_span!(
        "reconcile",
        operation = operation,
        api.name = %api.name,
        api.organization = %api.organization_id,
    )
}
