use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// Output goes to stderr: process workers own their stdout as the message
/// channel. `RUST_LOG` wins when set; otherwise the level is `info`, with
/// `debug` for this crate when `debug` is true. Safe to call more than once.
pub fn init(debug: bool) {
    let fallback = if debug { "info,offload=debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
