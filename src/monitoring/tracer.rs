/*!
 * Tracing
 * Structured logging setup and the per-run span
 */

use std::time::Instant;
use tracing::{debug, field, info, span, Level, Span};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - FAULT_BRIDGE_TRACE_JSON: Enable JSON output (default: false)
///
/// Returns `false` if a global subscriber was already installed, which makes
/// repeated calls from tests harmless.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("FAULT_BRIDGE_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(json = use_json, "Structured tracing initialized");
    }
    installed
}

/// Span covering one intercepted run, timed from creation to [`RunSpan::finish`]
pub struct RunSpan {
    span: Span,
    start: Instant,
}

impl RunSpan {
    pub fn new(worker: &str, bridge: &'static str) -> Self {
        let span = span!(
            Level::DEBUG,
            "fault_bridge_run",
            worker = worker,
            bridge = bridge,
            outcome = field::Empty,
            duration_us = field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
        }
    }

    /// The underlying span, for entering
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Record how the run ended
    pub fn finish(self, outcome: &str) {
        let duration = self.start.elapsed();
        self.span.record("outcome", outcome);
        self.span.record("duration_us", duration.as_micros() as u64);

        let _entered = self.span.enter();
        debug!(outcome, duration_us = duration.as_micros() as u64, "Run finished");
    }
}
