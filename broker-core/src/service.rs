//! Service host (C7): registers a service's handlers, monitors, and events
//! against a [`Provider`], and owns its start/stop lifecycle.
//!
//! Also carries `ServiceComponent`, the lifecycle trait for long-running
//! background work that isn't itself a bus handler (metrics exporters,
//! reapers, etc.) — cancelled cooperatively via a `CancellationToken`.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::auth::{Authenticator, Authorizer};
use crate::error::BrokerError;
use crate::pipeline::PipelineHandler;
use crate::provider::{CallHandler, Provider, Subscription, Unsubscribe, Validator};
use crate::rid::{Pattern, Resource};

/// A service: a [`Resource`] plus the handlers answering its patterns.
#[async_trait]
pub trait Service: Resource {
    /// Handler and validators for each non-event pattern this service
    /// exposes, aligned with [`Resource::patterns`].
    fn subscriptions(&self) -> Vec<(Pattern, Arc<dyn CallHandler>, Vec<Arc<dyn Validator>>)>;

    /// Background monitors this service keeps active while running:
    /// `(group, event pattern, handler)`. The host qualifies `group` with
    /// the service name to avoid cross-service collisions.
    fn monitors(&self) -> Vec<(String, Pattern, Arc<dyn CallHandler>)> {
        Vec::new()
    }

    /// Validators gating this service's own declared events:
    /// `(event pattern, publish validators, monitor validators)`.
    fn event_validators(&self) -> Vec<(Pattern, Vec<Arc<dyn Validator>>, Vec<Arc<dyn Validator>>)> {
        Vec::new()
    }

    async fn start(&self, _instance_id: Uuid) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn stop(&self) {}
}

/// Runs the `validateMonitor`/`validatePublish` reserved endpoints for a
/// service's declared events, dispatching to the validators registered
/// for the specific event named in the call payload.
struct EventValidationHandler {
    by_event: Vec<(String, Vec<Arc<dyn Validator>>)>,
}

#[async_trait]
impl CallHandler for EventValidationHandler {
    async fn handle(&self, call: crate::envelope::Call) {
        let event: Pattern = match call.parse_data() {
            Ok(p) => p,
            Err(_) => {
                let _ = call.error(BrokerError::InvalidParams("malformed event pattern".into())).await;
                return;
            }
        };
        let validators = self
            .by_event
            .iter()
            .find(|(name, _)| *name == event.endpoint_name())
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        for validator in &validators {
            let access = crate::envelope::Access::new(&call);
            validator.check(&access).await;
            if let crate::envelope::Verdict::Denied(err) = access.verdict() {
                let _ = call.error(err).await;
                return;
            }
        }
        let _ = call.ok().await;
    }
}

/// A service that has been wired onto a `Provider`: holds the instance
/// identity and every unsubscribe closure needed to tear it down.
pub struct RunningService {
    pub instance_id: Uuid,
    pub namespace_id: Uuid,
    unsubscribes: Vec<Unsubscribe>,
}

/// Registers services onto a shared `Provider` and authenticator/authorizer
/// pair, composing the request pipeline around every handler it wires up.
pub struct ServiceHost {
    provider: Arc<dyn Provider>,
    authenticator: Arc<dyn Authenticator>,
    authorizer: Arc<dyn Authorizer>,
}

impl ServiceHost {
    pub fn new(
        provider: Arc<dyn Provider>,
        authenticator: Arc<dyn Authenticator>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self { provider, authenticator, authorizer }
    }

    pub fn provider(&self) -> Arc<dyn Provider> {
        self.provider.clone()
    }

    /// Subscribe every handler/monitor/event-validator the service
    /// declares, then call its own `start`.
    pub async fn register(&self, service: Arc<dyn Service>) -> Result<RunningService, BrokerError> {
        let instance_id = Uuid::new_v4();
        let namespace_id = Uuid::new_v5(&Uuid::NAMESPACE_OID, service.service().as_bytes());
        info!(service = service.service(), %instance_id, %namespace_id, "registering service");

        let mut unsubscribes = Vec::new();

        for (pattern, handler, validators) in service.subscriptions() {
            let wrapped = Arc::new(
                PipelineHandler::new(handler, self.authenticator.clone(), self.authorizer.clone())
                    .with_validators(validators),
            );
            let unsub = self
                .provider
                .clone()
                .subscribe(Subscription { resource: pattern, handler: wrapped, validators: Vec::new() })
                .await?;
            unsubscribes.push(unsub);
        }

        for (group, pattern, handler) in service.monitors() {
            let qualified_group = format!("{}-{group}", service.service());
            let unsub = self.provider.clone().monitor(&qualified_group, pattern, handler, None).await?;
            unsubscribes.push(unsub);
        }

        let event_validators = service.event_validators();
        if !event_validators.is_empty() {
            let publish_by_event: Vec<_> = event_validators
                .iter()
                .map(|(p, pub_v, _)| (p.endpoint_name(), pub_v.clone()))
                .collect();
            let monitor_by_event: Vec<_> = event_validators
                .iter()
                .map(|(p, _, mon_v)| (p.endpoint_name(), mon_v.clone()))
                .collect();

            let publish_pattern = crate::rid::Method::new(
                service.service(),
                "",
                "validatePublish",
                "validatePublish",
                crate::rid::Verb::Internal,
            )
            .pattern();
            let monitor_pattern = crate::rid::Method::new(
                service.service(),
                "",
                "validateMonitor",
                "validateMonitor",
                crate::rid::Verb::Internal,
            )
            .pattern();

            let unsub = self
                .provider
                .clone()
                .subscribe(Subscription {
                    resource: publish_pattern,
                    handler: Arc::new(EventValidationHandler { by_event: publish_by_event }),
                    validators: Vec::new(),
                })
                .await?;
            unsubscribes.push(unsub);

            let unsub = self
                .provider
                .clone()
                .subscribe(Subscription {
                    resource: monitor_pattern,
                    handler: Arc::new(EventValidationHandler { by_event: monitor_by_event }),
                    validators: Vec::new(),
                })
                .await?;
            unsubscribes.push(unsub);
        }

        service.start(instance_id).await?;
        Ok(RunningService { instance_id, namespace_id, unsubscribes })
    }

    /// Unsubscribe everything the service registered, then call its own
    /// `stop`.
    pub async fn deregister(&self, service: Arc<dyn Service>, running: RunningService) {
        for unsub in running.unsubscribes {
            unsub().await;
        }
        service.stop().await;
    }
}

/// A background component that participates in the host's lifecycle but
/// doesn't handle bus calls directly (queue consumers, reapers, metrics
/// exporters). Runs until `shutdown` is cancelled.
pub trait ServiceComponent<S>: Sized + Send + 'static {
    fn from_state(state: &S) -> Self;

    fn start(self, shutdown: CancellationToken) -> impl Future<Output = ()> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAllAuthorizer, PermissiveAuthenticator};
    use crate::rid::{Method, Verb};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullSpecific;

    #[async_trait]
    impl crate::provider::SpecificProvider for NullSpecific {
        async fn subscribe_raw(
            &self,
            _s: String,
            _g: String,
            _h: crate::provider::RawHandler,
        ) -> Result<Unsubscribe, BrokerError> {
            Ok(Arc::new(|| Box::pin(async {})))
        }
        async fn request_raw(&self, _s: &str, _p: Vec<u8>, _t: Duration) -> Result<Vec<u8>, BrokerError> {
            Ok(Vec::new())
        }
        async fn publish_raw(&self, _s: &str, _p: Vec<u8>) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn reply_raw(&self, _s: &str, _p: Vec<u8>) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl CallHandler for EchoHandler {
        async fn handle(&self, call: crate::envelope::Call) {
            let _ = call.ok().await;
        }
    }

    struct SampleService;

    impl Resource for SampleService {
        fn service(&self) -> &str {
            "sample"
        }
        fn http_prefix(&self) -> &str {
            "api"
        }
        fn ws_prefix(&self) -> &str {
            "ws"
        }
        fn patterns(&self) -> Vec<Pattern> {
            vec![Method::new("sample", "api", "ping", "ping", Verb::Get).public().pattern()]
        }
    }

    #[async_trait]
    impl Service for SampleService {
        fn subscriptions(&self) -> Vec<(Pattern, Arc<dyn CallHandler>, Vec<Arc<dyn Validator>>)> {
            vec![(self.patterns().remove(0), Arc::new(EchoHandler), Vec::new())]
        }
    }

    #[tokio::test]
    async fn register_subscribes_every_declared_handler() {
        let provider: Arc<dyn Provider> = crate::provider::ProviderBase::new(NullSpecific, Duration::from_secs(1));
        let host = ServiceHost::new(provider, Arc::new(PermissiveAuthenticator), Arc::new(AllowAllAuthorizer));
        let running = host.register(Arc::new(SampleService)).await.unwrap();
        assert_ne!(running.instance_id, Uuid::nil());
        host.deregister(Arc::new(SampleService), running).await;
    }

    #[test]
    fn namespace_id_is_stable_for_same_service_name() {
        let a = Uuid::new_v5(&Uuid::NAMESPACE_OID, b"sample");
        let b = Uuid::new_v5(&Uuid::NAMESPACE_OID, b"sample");
        assert_eq!(a, b);
    }
}
