//! In-memory test transport (C5): records subscriptions for assertions and
//! dispatches `request_bytes` calls to hand-registered mock handlers
//! instead of a real bus, so unit tests can drive a single service's
//! `Access`/handler logic without standing up `broker-bus`.

use std::sync::Arc;

use async_trait::async_trait;
use broker_core::envelope::{Call, CallEnvelope, ReplyChannel};
use broker_core::error::BrokerError;
use broker_core::provider::{CallHandler, Provider, ProviderExt as _, RawHandler, SpecificProvider, Subscription, Unsubscribe};
use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Replies routed back into a pending `request_raw`'s oneshot — the only
/// `Provider` capability a mock handler actually needs when it calls
/// `call.ok()`/`call.error()`.
struct ReplyRouter {
    inboxes: Arc<DashMap<String, oneshot::Sender<Vec<u8>>>>,
}

#[async_trait]
impl Provider for ReplyRouter {
    async fn subscribe(self: Arc<Self>, _sub: Subscription) -> Result<Unsubscribe, BrokerError> {
        Err(BrokerError::ServiceUnavailable("test reply router does not support subscribe".into()))
    }

    async fn monitor(
        self: Arc<Self>,
        _group: &str,
        _event: broker_core::rid::Pattern,
        _handler: Arc<dyn CallHandler>,
        _token: Option<Vec<u8>>,
    ) -> Result<Unsubscribe, BrokerError> {
        Err(BrokerError::ServiceUnavailable("test reply router does not support monitor".into()))
    }

    async fn publish(
        &self,
        _pattern: &broker_core::rid::Pattern,
        _payload: Vec<u8>,
        _token: Option<Vec<u8>>,
    ) -> Result<(), BrokerError> {
        Err(BrokerError::ServiceUnavailable("test reply router does not support publish".into()))
    }

    async fn request_bytes(
        &self,
        _pattern: &broker_core::rid::Pattern,
        _payload: Vec<u8>,
        _token: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, BrokerError> {
        Err(BrokerError::ServiceUnavailable("test reply router does not support request".into()))
    }

    async fn reply(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if let Some((_, tx)) = self.inboxes.remove(subject) {
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Same dot-segment wildcard rule `broker-bus` uses, duplicated here so
/// this crate has no dependency on the reference transport.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let p: Vec<&str> = pattern.split('.').collect();
    let s: Vec<&str> = subject.split('.').collect();
    p.len() == s.len() && p.iter().zip(s.iter()).all(|(a, b)| *a == "*" || a == b)
}

/// In-memory `{endpoint -> Subscription}` / `{endpoint -> mock}` test
/// double. Construct it, register mocks and/or let services subscribe
/// through it, then drive calls via `ProviderBase::request_bytes`/`publish`.
pub struct TestProvider {
    subscriptions: Arc<DashMap<String, RawHandler>>,
    mocks: DashMap<String, Arc<dyn CallHandler>>,
    inboxes: Arc<DashMap<String, oneshot::Sender<Vec<u8>>>>,
}

impl TestProvider {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            mocks: DashMap::new(),
            inboxes: Arc::new(DashMap::new()),
        }
    }

    /// Registers a canned handler for `endpoint_name` (the dotted
    /// `service.generic.VERB` shape `Pattern::endpoint_name()` renders).
    /// `request_bytes` calls against this endpoint invoke it directly
    /// instead of reaching a subscribed service.
    pub fn register_mock(&self, endpoint_name: impl Into<String>, handler: Arc<dyn CallHandler>) {
        self.mocks.insert(endpoint_name.into(), handler);
    }

    /// True if some `Provider::subscribe` call registered a handler whose
    /// wildcarded subject matches `endpoint_name`.
    pub fn is_subscribed(&self, endpoint_name: &str) -> bool {
        self.subscriptions.iter().any(|e| subject_matches(e.key(), endpoint_name))
    }
}

impl Default for TestProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpecificProvider for TestProvider {
    async fn subscribe_raw(
        &self,
        subject: String,
        _queue_group: String,
        handler: RawHandler,
    ) -> Result<Unsubscribe, BrokerError> {
        self.subscriptions.insert(subject.clone(), handler);
        let subscriptions = self.subscriptions.clone();
        Ok(Arc::new(move || {
            let subscriptions = subscriptions.clone();
            let subject = subject.clone();
            Box::pin(async move {
                subscriptions.remove(&subject);
            })
        }))
    }

    async fn request_raw(
        &self,
        subject: &str,
        payload: Vec<u8>,
        _timeout: std::time::Duration,
    ) -> Result<Vec<u8>, BrokerError> {
        let mock = self
            .mocks
            .get(subject)
            .map(|m| m.clone())
            .ok_or_else(|| BrokerError::ServiceUnavailable(format!("no mock registered for {subject}")))?;

        let envelope: CallEnvelope = serde_json::from_slice(&payload)?;
        let reply_subject = format!("_MOCK_INBOX.{}", Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        self.inboxes.insert(reply_subject.clone(), tx);

        let provider: Arc<dyn Provider> = Arc::new(ReplyRouter { inboxes: self.inboxes.clone() });
        let call = Call::from_envelope(envelope, ReplyChannel { subject: reply_subject.clone(), provider })?;
        mock.handle(call).await;

        match rx.await {
            Ok(bytes) => Ok(bytes),
            Err(_) => {
                self.inboxes.remove(&reply_subject);
                Err(BrokerError::ServiceUnavailable(format!("mock for {subject} produced no reply")))
            }
        }
    }

    async fn publish_raw(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        for entry in self.subscriptions.iter() {
            if subject_matches(entry.key(), subject) {
                entry.value()(payload.clone(), String::new()).await;
            }
        }
        Ok(())
    }

    async fn reply_raw(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if let Some((_, tx)) = self.inboxes.remove(subject) {
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.subscriptions.clear();
        self.mocks.clear();
        Ok(())
    }
}
