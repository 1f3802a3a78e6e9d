//! Logging bootstrap.
//!
//! Installs a `tracing-subscriber` formatting layer driven by `RUST_LOG`
//! (defaulting to `info`), matching how every service in this ecosystem
//! wires up `tracing`.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
