//! The request pipeline (C6): authenticate, authorize, run validators,
//! dispatch to the handler, and guarantee a reply even if the handler
//! panics. Used uniformly by the service host, the HTTP edge, the
//! WebSocket edge, and the test transport.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::auth::{Authenticator, Authorizer};
use crate::envelope::{Access, Call, Message, Verdict};
use crate::error::BrokerError;
use crate::provider::{CallHandler, Validator};
use crate::rid::Verb;

/// Wraps a plain handler with authentication, authorization, and
/// validators, matching §4.6's four-stage pipeline. Panics inside the
/// inner handler are caught and surfaced as `InternalServerError` rather
/// than left to hang the caller (I4).
pub struct PipelineHandler {
    pub handler: Arc<dyn CallHandler>,
    pub validators: Vec<Arc<dyn Validator>>,
    pub authenticator: Arc<dyn Authenticator>,
    pub authorizer: Arc<dyn Authorizer>,
}

impl PipelineHandler {
    pub fn new(handler: Arc<dyn CallHandler>, authenticator: Arc<dyn Authenticator>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self { handler, validators: Vec::new(), authenticator, authorizer }
    }

    pub fn with_validators(mut self, validators: Vec<Arc<dyn Validator>>) -> Self {
        self.validators = validators;
        self
    }
}

#[async_trait]
impl CallHandler for PipelineHandler {
    async fn handle(&self, mut call: Call) {
        let requires_auth = call.endpoint().verb() != Verb::Internal && !call.endpoint().is_public();

        if requires_auth {
            debug!(endpoint = %call.endpoint().endpoint_name(), "authenticating call");
            match self.authenticator.validate_token(call.raw_token()).await {
                Ok(processed) => call.set_token(processed),
                Err(_) => {
                    let _ = call.error(BrokerError::Unauthorized("invalid token".into())).await;
                    return;
                }
            }
            debug!(endpoint = %call.endpoint().endpoint_name(), "authorizing call");
            if !self.authorizer.has_permission(&call).await {
                let _ = call.error(BrokerError::Forbidden("insufficient permission".into())).await;
                return;
            }
        }

        for validator in &self.validators {
            let access = Access::new(&call);
            validator.check(&access).await;
            if let Verdict::Denied(err) = access.verdict() {
                let _ = call.error(err).await;
                return;
            }
        }

        let reply = call.reply_channel().clone();
        let handler = self.handler.clone();
        let joined = tokio::spawn(async move {
            handler.handle(call).await;
        })
        .await;

        if let Err(join_err) = joined {
            if join_err.is_panic() {
                warn!("handler panicked, returning InternalServerError");
                let msg = Message::from_error(&BrokerError::InternalServerError("handler panicked".into()));
                if let Ok(bytes) = serde_json::to_vec(&msg) {
                    let _ = reply.send(bytes).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAllAuthorizer, PermissiveAuthenticator};
    use crate::envelope::ReplyChannel;
    use crate::provider::{Provider, SpecificProvider, Unsubscribe, RawHandler};
    use crate::rid::Method;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct NullSpecific;

    #[async_trait]
    impl SpecificProvider for NullSpecific {
        async fn subscribe_raw(&self, _s: String, _g: String, _h: RawHandler) -> Result<Unsubscribe, BrokerError> {
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

    struct RecordingHandler(Arc<AtomicBool>);

    #[async_trait]
    impl CallHandler for RecordingHandler {
        async fn handle(&self, call: Call) {
            self.0.store(true, Ordering::SeqCst);
            let _ = call.ok().await;
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl CallHandler for PanicHandler {
        async fn handle(&self, _call: Call) {
            panic!("boom");
        }
    }

    fn sample_call(public: bool, provider: Arc<dyn Provider>) -> Call {
        let mut method = Method::new("svc", "api", "leaf", "leaf", Verb::Get);
        if public {
            method = method.public();
        }
        let pattern = method.pattern();
        Call::new(pattern, b"{}".to_vec(), ReplyChannel { subject: "inbox.1".into(), provider })
    }

    #[tokio::test]
    async fn unauthorized_short_circuits_before_handler() {
        let provider: Arc<dyn Provider> = crate::provider::ProviderBase::new(NullSpecific, Duration::from_secs(1));
        let ran = Arc::new(AtomicBool::new(false));
        let pipeline = PipelineHandler::new(
            Arc::new(RecordingHandler(ran.clone())),
            Arc::new(PermissiveAuthenticator),
            Arc::new(AllowAllAuthorizer),
        );
        let call = sample_call(false, provider);
        pipeline.handle(call).await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn public_endpoint_skips_authentication() {
        let provider: Arc<dyn Provider> = crate::provider::ProviderBase::new(NullSpecific, Duration::from_secs(1));
        let ran = Arc::new(AtomicBool::new(false));
        let pipeline = PipelineHandler::new(
            Arc::new(RecordingHandler(ran.clone())),
            Arc::new(PermissiveAuthenticator),
            Arc::new(AllowAllAuthorizer),
        );
        let call = sample_call(true, provider);
        pipeline.handle(call).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn handler_panic_does_not_propagate() {
        let provider: Arc<dyn Provider> = crate::provider::ProviderBase::new(NullSpecific, Duration::from_secs(1));
        let pipeline = PipelineHandler::new(
            Arc::new(PanicHandler),
            Arc::new(PermissiveAuthenticator),
            Arc::new(AllowAllAuthorizer),
        );
        let call = sample_call(true, provider);
        // Must return normally rather than panicking the calling task.
        pipeline.handle(call).await;
    }
}
