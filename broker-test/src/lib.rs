//! Test tooling shared across the workspace (C5 + C14): an in-process
//! HTTP client for the `broker-http` router, and an in-memory `Provider`
//! for driving service/handler unit tests without `broker-bus`.

mod app;
mod mocks;

pub use app::{TestApp, TestResponse};
pub use mocks::TestProvider;
