//! Token verification seam.
//!
//! Credential issuance is upstream; the gateway only needs to turn a
//! bearer token into a pinned identity once per handshake.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Verified identity pinned to a connection for its lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    pub user_id: String,
    pub email: String,
    pub plan_type: String,
}

/// Token verification failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("invalid token")]
    InvalidToken,

    #[error("token revoked")]
    Revoked,
}

/// Verifies bearer tokens. The token format is opaque to the core.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<AuthContext, AuthError>;
}

/// In-memory verifier for tests and dev mode: a fixed token→identity
/// map plus a process-scoped revocation list.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: Mutex<HashMap<String, AuthContext>>,
    revoked: Mutex<Vec<String>>,
}

impl StaticTokenVerifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, token: &str, context: AuthContext) {
        self.tokens
            .lock()
            .unwrap()
            .insert(token.to_string(), context);
    }

    /// Revoke a token process-wide.
    pub fn revoke(&self, token: &str) {
        self.revoked.lock().unwrap().push(token.to_string());
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<AuthContext, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        if self.revoked.lock().unwrap().iter().any(|t| t == token) {
            return Err(AuthError::Revoked);
        }
        self.tokens
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(user: &str) -> AuthContext {
        AuthContext {
            user_id: user.to_string(),
            email: format!("{user}@example.com"),
            plan_type: "pro".to_string(),
        }
    }

    #[test]
    fn known_token_verifies() {
        let verifier = StaticTokenVerifier::new();
        verifier.insert("tok-u1", context("u1"));
        assert_eq!(verifier.verify("tok-u1").unwrap().user_id, "u1");
    }

    #[test]
    fn unknown_and_empty_tokens_fail() {
        let verifier = StaticTokenVerifier::new();
        assert!(matches!(
            verifier.verify("nope"),
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(verifier.verify(""), Err(AuthError::MissingToken)));
    }

    #[test]
    fn revoked_token_fails() {
        let verifier = StaticTokenVerifier::new();
        verifier.insert("tok-u1", context("u1"));
        verifier.revoke("tok-u1");
        assert!(matches!(verifier.verify("tok-u1"), Err(AuthError::Revoked)));
    }
}
