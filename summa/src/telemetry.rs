//! Logging glue for hosts embedding the engine.
//!
//! The library itself only emits tracing spans and events; installing a
//! subscriber is the host's decision. [`init_logging`] is the one-call
//! setup used by binaries and the test harness.

use tracing::subscriber::set_global_default;
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

/// Log an error through the alternate selector, which emits the whole
/// source chain.
pub fn log_error(e: impl Into<anyhow::Error>) {
    let e: anyhow::Error = e.into();
    tracing::error!("{e:#}");
}

/// Install a stderr subscriber honoring `RUST_LOG`, falling back to the
/// given filter, and bridge `log` records into tracing.
///
/// Call at most once per process.
pub fn init_logging(default_filter: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let stderr = fmt::Layer::new()
        .with_writer(std::io::stderr)
        .with_target(false);
    let subscriber = Registry::default().with(env_filter).with(stderr);
    LogTracer::init().expect("Failed to set logger");
    set_global_default(subscriber).expect("Failed to set subscriber");
}
