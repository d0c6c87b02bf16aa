//! Tracing setup for scrumsync binaries.
//!
//! [`init_tracing`] installs a `tracing-subscriber` registry with an
//! [`EnvFilter`] (from `RUST_LOG`, falling back to the given default) and an
//! stderr fmt layer. Built with the `telemetry` feature, it also adds an
//! OpenTelemetry OTLP layer when the standard OTel environment asks for one:
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 scrumsync simulate
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to keep export off even when the endpoint is
//! set.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{OtelGuard, otel_layer};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Whether the environment asks for OTel export.
///
/// True when `OTEL_SDK_DISABLED` is not `"true"` and either
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set or `OTEL_TRACES_EXPORTER` is set to
/// something other than `"none"`.
pub fn otel_enabled() -> bool {
    if std::env::var("OTEL_SDK_DISABLED")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        return false;
    }

    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        return true;
    }

    if let Ok(exporter) = std::env::var("OTEL_TRACES_EXPORTER") {
        return !exporter.eq_ignore_ascii_case("none");
    }

    false
}

/// Keeps exporters alive. Hold it until the process exits.
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "telemetry")]
    _otel: Option<OtelGuard>,
}

/// Install the global subscriber.
///
/// `default_filter` applies when `RUST_LOG` is unset or invalid. Calling this
/// twice leaves the first subscriber in place. With OTel export enabled this
/// must run inside a tokio runtime.
pub fn init_tracing(service_name: &str, default_filter: &str) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    #[cfg(feature = "telemetry")]
    if otel_enabled() {
        match otel_layer(service_name) {
            Ok((layer, guard)) => {
                let _ = registry.with(layer).try_init();
                return TelemetryGuard { _otel: Some(guard) };
            }
            Err(e) => {
                eprintln!("OTel export disabled: {e}");
                let _ = registry.try_init();
                return TelemetryGuard::default();
            }
        }
    }

    #[cfg(not(feature = "telemetry"))]
    if otel_enabled() {
        eprintln!("{service_name}: OTEL_* set but built without the `telemetry` feature");
    }

    let _ = registry.try_init();
    TelemetryGuard::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        let _first = init_tracing("scrumsync-test", "debug");
        let _second = init_tracing("scrumsync-test", "info");
        tracing::info!("still logging");
    }
}
