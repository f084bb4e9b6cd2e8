//! Socket handshake authentication.
//!
//! Clients supply a signed bearer token (`{ sub, exp }`, HS256) in the
//! `token` query parameter of the upgrade URL. The gate verifies the
//! signature and expiry, then resolves the referenced user record into an
//! [`Identity`]. All failures refuse the session before any dispatcher
//! state is allocated: missing/invalid tokens at the upgrade itself,
//! unknown users with a close-frame reason right after it.

use std::sync::Arc;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::MetadataStore;

/// The verified identity bound to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub email: String,
}

/// Bearer token claims.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Expiry, unix seconds.
    pub exp: usize,
}

/// Authentication failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,
    #[error("invalid credential")]
    Invalid,
    #[error("unknown user")]
    UnknownUser,
}

/// Validates bearer credentials and binds identities.
pub struct AuthGate {
    decoding_key: DecodingKey,
    store: Arc<dyn MetadataStore>,
}

impl AuthGate {
    pub fn new(jwt_secret: &str, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            store,
        }
    }

    /// Verify signature and expiry, returning the token's user id.
    ///
    /// Synchronous on purpose: this part runs inside the upgrade callback,
    /// where a refusal still maps to an HTTP 401.
    pub fn verify_token(&self, token: Option<&str>) -> Result<String, AuthError> {
        let token = match token {
            Some(t) if !t.is_empty() => t,
            _ => return Err(AuthError::Missing),
        };
        let data = decode::<Claims>(
            token,
            &self.decoding_key,
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|_| AuthError::Invalid)?;
        Ok(data.claims.sub)
    }

    /// Resolve a verified user id to its identity.
    pub async fn resolve_identity(&self, user_id: &str) -> Result<Identity, AuthError> {
        let user = self
            .store
            .find_user_by_id(user_id)
            .await
            .map_err(|e| {
                log::warn!("user lookup failed for {user_id}: {e}");
                AuthError::UnknownUser
            })?
            .ok_or(AuthError::UnknownUser)?;
        Ok(Identity {
            id: user.id,
            name: user.name,
            email: user.email,
        })
    }
}

/// Extract the `token` query parameter from an upgrade request URI.
pub fn token_from_query(query: Option<&str>) -> Option<&str> {
    let query = query?;
    for pair in query.split('&') {
        let mut it = pair.splitn(2, '=');
        if it.next() == Some("token") {
            return it.next();
        }
    }
    None
}

/// Issue a token for `user_id` expiring `ttl_secs` from now. Intended for
/// tests and tooling; production credentials come from the auth service.
pub fn issue_token(
    jwt_secret: &str,
    user_id: &str,
    ttl_secs: u64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (now + ttl_secs) as usize,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(jwt_secret.as_bytes()),
    )
}
