use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber used by the system binaries.
/// `RUST_LOG` takes precedence; `default_directive` (e.g. `microcam=info`)
/// is added on top so the library is never silent by default.
///
/// Calling this twice is harmless, the second installation is ignored.
pub fn init(default_directive: &str) {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = default_directive.parse() {
        filter = filter.add_directive(directive);
    }
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
