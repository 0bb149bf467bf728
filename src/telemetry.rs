//! Optional tracing and diagnostics bootstrap for binaries and tests.

use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a fmt subscriber with env-based filtering and span error capture.
///
/// Filtering follows `RUST_LOG` when set, defaulting to warnings plus this
/// crate's info spans. Safe to call once per process; library code never
/// calls this itself.
pub fn init_tracing() {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,duraflow=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// Install miette's pretty panic hook alongside tracing.
pub fn init_diagnostics() {
    miette::set_panic_hook();
}
