//! Telemetry is an external collaborator: a span-emitting handle is injected
//! into the components that need one, rather than each component owning a
//! global tracer. This mirrors the original's embedded `*instr.Instrumentation`.

use tracing::Span;

/// A cheap-to-clone handle used to open root spans for top-level
/// operations (one per crawl) that child spans (one per sub-step) attach
/// to as a parent.
#[derive(Debug, Clone, Default)]
pub struct Instrumentation {
    service: &'static str,
}

impl Instrumentation {
    pub fn new(service: &'static str) -> Self {
        Self { service }
    }

    /// Opens a new span for `operation`, parented to the current span.
    pub fn span(&self, operation: &'static str) -> Span {
        tracing::info_span!("crawl", service = self.service, operation)
    }
}

/// Installs a human-readable, `RUST_LOG`-driven subscriber. Intended for
/// binaries and tests, never called by the library itself.
pub fn init_test_subscriber() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}
