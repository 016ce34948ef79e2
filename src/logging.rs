use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Respects `RUST_LOG`; defaults to info for the crate and warn for the
/// noisy http internals.
pub fn init_tracer() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,hyper=warn,reqwest=warn,html5ever=warn,selectors=warn")
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
