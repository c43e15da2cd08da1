//! Observability (C12): a single entry point to wire up `tracing` the same
//! way across every binary that embeds the broker (service host, HTTP
//! edge, test harness).

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::BrokerConfig;

/// Installs a global `tracing` subscriber filtered by `config.log_level`,
/// falling back to `RUST_LOG` and then `"info"` if the configured level
/// fails to parse. Safe to call once per process; a second call is a
/// no-op (the underlying `set_global_default` error is swallowed).
pub fn init_tracing(config: &BrokerConfig) {
    let filter = EnvFilter::try_new(&config.log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
