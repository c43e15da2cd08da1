//! Error bridging for the advisory lock. Due to Rust's orphan rules we
//! can't implement `From<sqlx::Error> for BrokerError` directly in
//! `broker-core`, so the conversion lives here, behind this crate's own
//! dependency on `sqlx`.

broker_core::map_error! {
    sqlx::Error => InternalServerError,
}
