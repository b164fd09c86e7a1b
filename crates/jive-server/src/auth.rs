//! Handshake authentication.
//!
//! Tokens are issued by the account service as HS256 JWTs whose subject is
//! the user id. This module only verifies them.

use axum::http::HeaderMap;
use jive_shared::UserId;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    #[serde(alias = "userId")]
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verify `token` and return the user id it was issued for.
    pub fn verify(&self, token: &str) -> Result<UserId, ServerError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| ServerError::Unauthorized(format!("invalid token: {e}")))?;
        UserId::parse(&data.claims.sub)
            .map_err(|_| ServerError::Unauthorized("token subject is not a user id".into()))
    }
}

/// The bearer token of a handshake: `?token=` wins over the
/// `Authorization` header.
pub fn bearer_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query_token.map(str::trim).filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }

    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
