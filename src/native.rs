use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber for the binary.
/// Uses RUST_LOG env var for filtering (defaults to info).
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry
            .with(fmt::layer().with_ansi(true).with_writer(std::io::stderr))
            .init();
    }
}
