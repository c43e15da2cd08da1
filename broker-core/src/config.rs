//! Environment-first configuration (C11).
//!
//! Loads `.env` if present, then reads the handful of environment
//! variables the broker runtime needs. There is no config file format —
//! every deployment is expected to set these as real environment
//! variables (container env, systemd unit, etc.).

use std::time::Duration;

/// Runtime configuration for a broker process.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Default request timeout for `Provider::request_bytes`.
    pub timeout: Duration,
    /// `tracing-subscriber` env-filter directive, e.g. `"info"` or
    /// `"broker_core=debug,tower_http=info"`.
    pub log_level: String,
    /// Upper bound on concurrent in-flight calls the reference bus
    /// transport admits before backpressuring (see `broker-bus`).
    pub bus_max_conns: usize,
    /// Upper bound on distinct subjects the reference bus transport will
    /// track subscriptions for.
    pub bus_max_chans: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(30_000),
            log_level: "info".into(),
            bus_max_conns: 20,
            bus_max_chans: 100,
        }
    }
}

impl BrokerConfig {
    /// Load `.env` (if present) then read `TIMEOUT` (milliseconds),
    /// `API_LOG_LEVEL`, `BUS_MAX_CONNS`, `BUS_MAX_CHANS`, falling back to
    /// defaults for any variable that is unset or unparsable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();

        if let Ok(raw) = std::env::var("TIMEOUT") {
            if let Ok(ms) = raw.parse::<u64>() {
                cfg.timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(level) = std::env::var("API_LOG_LEVEL") {
            cfg.log_level = level;
        }
        if let Ok(raw) = std::env::var("BUS_MAX_CONNS") {
            if let Ok(n) = raw.parse() {
                cfg.bus_max_conns = n;
            }
        }
        if let Ok(raw) = std::env::var("BUS_MAX_CHANS") {
            if let Ok(n) = raw.parse() {
                cfg.bus_max_chans = n;
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.timeout, Duration::from_millis(30_000));
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn non_numeric_timeout_falls_back_to_default() {
        std::env::set_var("TIMEOUT", "soon");
        let cfg = BrokerConfig::from_env();
        std::env::remove_var("TIMEOUT");
        assert_eq!(cfg.timeout, Duration::from_millis(30_000));
    }
}
