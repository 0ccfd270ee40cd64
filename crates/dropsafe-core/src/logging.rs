//! Process-wide logging bootstrap shared by every dropsafe binary.

use env_logger::Env;

/// Initialise `env_logger` with a default filter, honouring `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(default_level: &str) {
    let env = Env::default().default_filter_or(default_level);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}
