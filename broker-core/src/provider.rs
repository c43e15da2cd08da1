//! Transport-agnostic provider contract (C3): [`Provider`] is the
//! high-level surface services and edges call; [`SpecificProvider`] is the
//! small set of raw operations a transport must implement. [`ProviderBase`]
//! composes one generic `Provider` impl against any `SpecificProvider`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::envelope::{Call, CallEnvelope, ReplyChannel};
use crate::error::BrokerError;
use crate::rid::{Method, Pattern, Verb};

/// Cancels a subscription or monitor.
pub type Unsubscribe = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Delivers a raw frame (`payload`, `reply subject`) to a subscriber.
pub type RawHandler =
    Arc<dyn Fn(Vec<u8>, String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// One call handler bound to a resource pattern plus its access validators.
#[async_trait]
pub trait CallHandler: Send + Sync {
    async fn handle(&self, call: Call);
}

/// Runs before a handler; grants or denies the call.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn check(&self, access: &crate::envelope::Access<'_>);
}

/// A handler registration: the generic pattern it answers, the handler
/// itself, and the access validators that must grant before it runs.
///
/// `validators` is consumed by the service host when it builds the
/// pipeline-wrapped handler (see `broker_core::pipeline::PipelineHandler`)
/// — by the time a `Subscription` reaches `Provider::subscribe`, auth and
/// validation are already baked into `handler`.
pub struct Subscription {
    pub resource: Pattern,
    pub handler: Arc<dyn CallHandler>,
    pub validators: Vec<Arc<dyn Validator>>,
}

/// An `Event`-verb pattern plus the validators gating publish and monitor.
pub struct EventDecl {
    pub resource: Pattern,
    pub publish_validators: Vec<Arc<dyn Validator>>,
    pub monitor_validators: Vec<Arc<dyn Validator>>,
}

/// The five raw operations a transport must provide.
#[async_trait]
pub trait SpecificProvider: Send + Sync {
    async fn subscribe_raw(
        &self,
        subject: String,
        queue_group: String,
        handler: RawHandler,
    ) -> Result<Unsubscribe, BrokerError>;

    async fn request_raw(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BrokerError>;

    async fn publish_raw(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn reply_raw(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// The transport-agnostic surface used by services and edges.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn subscribe(self: Arc<Self>, sub: Subscription) -> Result<Unsubscribe, BrokerError>;

    async fn monitor(
        self: Arc<Self>,
        group: &str,
        event: Pattern,
        handler: Arc<dyn CallHandler>,
        token: Option<Vec<u8>>,
    ) -> Result<Unsubscribe, BrokerError>;

    async fn publish(
        &self,
        pattern: &Pattern,
        payload: Vec<u8>,
        token: Option<Vec<u8>>,
    ) -> Result<(), BrokerError>;

    async fn request_bytes(
        &self,
        pattern: &Pattern,
        payload: Vec<u8>,
        token: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, BrokerError>;

    async fn reply(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Typed convenience wrapper over [`Provider::request_bytes`].
#[async_trait]
pub trait ProviderExt: Provider {
    async fn request<Out>(
        &self,
        pattern: &Pattern,
        payload: &(impl Serialize + Sync),
        token: Option<Vec<u8>>,
    ) -> Result<Out, BrokerError>
    where
        Out: DeserializeOwned,
    {
        let bytes = serde_json::to_vec(payload)?;
        let resp = self.request_bytes(pattern, bytes, token).await?;
        if resp.is_empty() {
            return Err(BrokerError::ServiceUnavailable("empty reply".into()));
        }
        serde_json::from_slice(&resp).map_err(BrokerError::from)
    }
}

impl<T: Provider + ?Sized> ProviderExt for T {}

/// Replaces each `$Name` segment of a dotted subject with `*`.
fn wildcard_subject(endpoint_name: &str) -> String {
    endpoint_name
        .split('.')
        .map(|seg| if seg.starts_with('$') { "*" } else { seg })
        .collect::<Vec<_>>()
        .join(".")
}

fn decode_call(
    payload: Vec<u8>,
    reply_subject: String,
    provider: Arc<dyn Provider>,
) -> Result<Call, BrokerError> {
    let envelope: CallEnvelope = serde_json::from_slice(&payload)?;
    let reply = ReplyChannel { subject: reply_subject, provider };
    Call::from_envelope(envelope, reply)
}

/// Generic `Provider` built over any [`SpecificProvider`].
///
/// Owns subscription wildcarding, queue-group naming, and the
/// `validateMonitor`/`validatePublish` event call-out policy; delegates
/// the actual bytes-on-the-wire work to `S`.
pub struct ProviderBase<S: SpecificProvider> {
    specific: S,
    default_timeout: Duration,
}

impl<S: SpecificProvider + 'static> ProviderBase<S> {
    pub fn new(specific: S, default_timeout: Duration) -> Arc<Self> {
        Arc::new(Self { specific, default_timeout })
    }

    /// Access to the underlying transport, e.g. for test doubles that
    /// expose assertion helpers beyond the `Provider`/`SpecificProvider`
    /// contract.
    pub fn specific(&self) -> &S {
        &self.specific
    }

    async fn validate_event(
        &self,
        service: &str,
        reserved_endpoint: &str,
        event: &Pattern,
        token: &[u8],
    ) -> Result<(), BrokerError> {
        let validator_pattern =
            Method::new(service, "", reserved_endpoint, reserved_endpoint, Verb::Internal).pattern();
        let payload = serde_json::to_vec(event)?;
        match self
            .request_bytes(&validator_pattern, payload, Some(token.to_vec()))
            .await
        {
            Ok(_) => Ok(()),
            // v1 peers without the reserved endpoint must not be locked out.
            Err(BrokerError::ServiceUnavailable(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<S: SpecificProvider + 'static> Provider for ProviderBase<S> {
    async fn subscribe(self: Arc<Self>, sub: Subscription) -> Result<Unsubscribe, BrokerError> {
        let subject = wildcard_subject(&sub.resource.endpoint_name());
        let queue_group = format!("sub.{}", sub.resource.method.service);
        let provider: Arc<dyn Provider> = self.clone();
        let handler = sub.handler.clone();
        let raw: RawHandler = Arc::new(move |payload, reply_subject| {
            let provider = provider.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let call = match decode_call(payload, reply_subject, provider) {
                    Ok(c) => c,
                    Err(_) => return,
                };
                handler.handle(call).await;
            })
        });
        self.specific.subscribe_raw(subject, queue_group, raw).await
    }

    async fn monitor(
        self: Arc<Self>,
        group: &str,
        event: Pattern,
        handler: Arc<dyn CallHandler>,
        token: Option<Vec<u8>>,
    ) -> Result<Unsubscribe, BrokerError> {
        if let Some(tok) = &token {
            if event.verb() == Verb::Event {
                self.validate_event(&event.method.service, "validateMonitor", &event, tok)
                    .await?;
            }
        }
        let subject = wildcard_subject(&event.endpoint_specific());
        let provider: Arc<dyn Provider> = self.clone();
        let raw: RawHandler = Arc::new(move |payload, reply_subject| {
            let provider = provider.clone();
            let handler = handler.clone();
            Box::pin(async move {
                if let Ok(call) = decode_call(payload, reply_subject, provider) {
                    handler.handle(call).await;
                }
            })
        });
        self.specific.subscribe_raw(subject, group.to_string(), raw).await
    }

    async fn publish(
        &self,
        pattern: &Pattern,
        payload: Vec<u8>,
        token: Option<Vec<u8>>,
    ) -> Result<(), BrokerError> {
        if let Some(tok) = &token {
            if pattern.verb() == Verb::Event {
                self.validate_event(&pattern.method.service, "validatePublish", pattern, tok)
                    .await?;
            }
        }
        self.specific.publish_raw(&pattern.endpoint_specific(), payload).await
    }

    async fn request_bytes(
        &self,
        pattern: &Pattern,
        payload: Vec<u8>,
        token: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, BrokerError> {
        let data = serde_json::from_slice(&payload).unwrap_or(serde_json::Value::Null);
        let token_str = token.map(|t| String::from_utf8_lossy(&t).into_owned());
        let envelope = CallEnvelope {
            data,
            reply: String::new(),
            endpoint_pattern: pattern.clone(),
            token: token_str.clone(),
            api_version: 2,
            params_v1: None,
            token_v1: token_str,
            query_v1: pattern.query().map(|q| q.to_string()),
        };
        let bytes = serde_json::to_vec(&envelope)?;
        self.specific
            .request_raw(&pattern.endpoint_name(), bytes, self.default_timeout)
            .await
    }

    async fn reply(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.specific.reply_raw(subject, payload).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.specific.close().await
    }
}
