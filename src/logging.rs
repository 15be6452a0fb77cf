use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber.
///
/// Level comes from `RUST_LOG` (default `info`). Output goes to stderr because
/// stdout carries the IPC protocol.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .try_init();
}
