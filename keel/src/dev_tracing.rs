//! Logging setup for the examples, benches and integration tests.

use tracing_subscriber::EnvFilter;

/// Install a compact fmt subscriber filtered by `RUST_LOG`.
///
/// Does nothing when `RUST_LOG` is unset. Returns `true` only if this call
/// installed the global subscriber, so repeated calls from tests are fine.
pub fn init_tracing() -> bool {
    let Some(directives) = std::env::var_os("RUST_LOG") else {
        return false;
    };
    let filter = EnvFilter::try_new(directives.to_string_lossy()).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
