//! Telemetry error types.

use std::fmt;

use thiserror::Error;

use opentelemetry_otlp::ExporterBuildError;

/// Failure inside the telemetry core.
///
/// None of these ever reach a business-logic response; callers log and
/// continue with a degraded (noop) component. Invalid instrument names
/// never surface here: the SDK logs them and hands back a noop instrument.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to build {signal} exporter: {source}")]
    Exporter {
        signal: &'static str,
        #[source]
        source: ExporterBuildError,
    },

    #[error("telemetry shutdown failed: {}", ShutdownErrors(.0))]
    Shutdown(Vec<ProviderShutdownError>),
}

/// One provider's shutdown failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderShutdownError {
    pub provider: &'static str,
    pub reason: String,
}

impl fmt::Display for ProviderShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} provider: {}", self.provider, self.reason)
    }
}

struct ShutdownErrors<'a>(&'a [ProviderShutdownError]);

impl fmt::Display for ShutdownErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}
