pub mod auth;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod prelude;
pub mod provider;
pub mod rid;
pub mod service;
pub mod ws;

pub use auth::{AllowAllAuthorizer, Authenticator, Authorizer, PermissiveAuthenticator};
pub use config::BrokerConfig;
pub use envelope::{Access, Call, CallEnvelope, FilePayload, Message, ReplyChannel, Verdict};
pub use error::BrokerError;
pub use logging::init_tracing;
pub use pipeline::PipelineHandler;
pub use provider::{CallHandler, EventDecl, Provider, ProviderBase, ProviderExt, SpecificProvider, Subscription, Unsubscribe, Validator};
pub use rid::{Method, Pattern, Resource, Verb};
pub use service::{RunningService, Service, ServiceComponent, ServiceHost};
pub use ws::{WsEdge, WsError, WsFrame, WsSession};
