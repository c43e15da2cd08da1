//! Broker — a service-fabric library: RID addressing, a `Provider`
//! transport contract, and HTTP/WS edges on top of it. Import everything
//! with:
//!
//! ```ignore
//! use broker::prelude::*;
//! ```
//!
//! # Feature flags
//!
//! | Feature | Default | Crate         |
//! |---------|---------|---------------|
//! | `bus`   | **yes** | `broker-bus`  |
//! | `lock`  | no      | `broker-lock` |
//! | `http`  | no      | `broker-http` |
//! | `test`  | no      | `broker-test` |
//! | `full`  | no      | All of the above |

pub extern crate broker_core;

// Re-export everything from broker-core at the top level for convenience.
pub use broker_core::*;

#[cfg(feature = "bus")]
pub use broker_bus;

#[cfg(feature = "lock")]
pub use broker_lock;

#[cfg(feature = "http")]
pub use broker_http;

#[cfg(feature = "test")]
pub use broker_test;

/// Unified prelude — import everything with `use broker::prelude::*`.
pub mod prelude {
    pub use broker_core::prelude::*;

    #[cfg(feature = "bus")]
    pub use broker_bus::LocalBus;

    #[cfg(feature = "lock")]
    pub use broker_lock::{LockRepository, PgLockRepository};

    #[cfg(feature = "http")]
    pub use broker_http::HttpEdge;

    #[cfg(feature = "test")]
    pub use broker_test::{TestApp, TestProvider, TestResponse};
}
