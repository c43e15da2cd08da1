//! Authentication/authorization collaborators.
//!
//! These traits are the only contract the broker has with an identity
//! backend — the backend itself (JWT issuer, session store, OIDC
//! provider...) is external to this crate.

use async_trait::async_trait;

use crate::envelope::Call;
use crate::error::BrokerError;

/// Validates a raw bearer token and returns the processed token (the value
/// stored back on the `Call` and visible to the handler).
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn validate_token(&self, raw_token: &[u8]) -> Result<Vec<u8>, BrokerError>;
}

/// Decides whether an authenticated call may reach its handler.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn has_permission(&self, call: &Call) -> bool;
}

/// An authenticator that accepts any non-empty token unchanged. Useful for
/// local development and for services that enforce authorization only.
pub struct PermissiveAuthenticator;

#[async_trait]
impl Authenticator for PermissiveAuthenticator {
    async fn validate_token(&self, raw_token: &[u8]) -> Result<Vec<u8>, BrokerError> {
        if raw_token.is_empty() {
            return Err(BrokerError::Unauthorized("missing token".into()));
        }
        Ok(raw_token.to_vec())
    }
}

/// An authorizer that grants every authenticated call.
pub struct AllowAllAuthorizer;

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
    async fn has_permission(&self, _call: &Call) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permissive_authenticator_rejects_empty_token() {
        let auth = PermissiveAuthenticator;
        assert!(auth.validate_token(b"").await.is_err());
        assert!(auth.validate_token(b"tok").await.is_ok());
    }
}
