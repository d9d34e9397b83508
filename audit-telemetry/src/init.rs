//! Subscriber initialisation.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

use crate::capture::SpanCapture;

/// `RUST_LOG` when set, otherwise `info`.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a human-readable subscriber for `service_name`.
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place and return the error.
pub fn init_telemetry(service_name: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;
    tracing::debug!(service = service_name, "telemetry initialised");
    Ok(())
}

/// Like [`init_telemetry`] with one JSON object per line, for log shippers.
pub fn init_with_json(service_name: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().json().with_current_span(true).with_span_list(false))
        .try_init()?;
    tracing::debug!(service = service_name, format = "json", "telemetry initialised");
    Ok(())
}

/// Install a human-readable subscriber that also records closed spans into
/// `capture`.
pub fn init_with_capture(service_name: &str, capture: &SpanCapture) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(capture.layer())
        .try_init()?;
    tracing::debug!(service = service_name, "telemetry initialised with span capture");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_rejected_not_fatal() {
        let _ = init_telemetry("audit-test");
        assert!(init_with_json("audit-test").is_err());
    }
}
