//! Broker prelude — import everything a service implementation needs with
//! a single `use`.
//!
//! ```ignore
//! use broker_core::prelude::*;
//!
//! struct Profile;
//!
//! impl Resource for Profile {
//!     fn service(&self) -> &str { "profile" }
//!     fn http_prefix(&self) -> &str { "api" }
//!     fn ws_prefix(&self) -> &str { "ws" }
//!     fn patterns(&self) -> Vec<Pattern> {
//!         vec![Method::new("profile", "api", "get", "get.$ID", Verb::Get).pattern()]
//!     }
//! }
//! ```

pub use crate::auth::{AllowAllAuthorizer, Authenticator, Authorizer, PermissiveAuthenticator};
pub use crate::config::BrokerConfig;
pub use crate::envelope::{Access, Call, CallEnvelope, FilePayload, Message, ReplyChannel, TraceFrame, Verdict};
pub use crate::error::BrokerError;
pub use crate::logging::init_tracing;
pub use crate::pipeline::PipelineHandler;
pub use crate::provider::{
    CallHandler, EventDecl, Provider, ProviderBase, ProviderExt, SpecificProvider, Subscription,
    Unsubscribe, Validator,
};
pub use crate::rid::{Method, Pattern, Resource, Verb};
pub use crate::service::{RunningService, Service, ServiceComponent, ServiceHost};
pub use crate::ws::{WsEdge, WsSession};

pub use async_trait::async_trait;
