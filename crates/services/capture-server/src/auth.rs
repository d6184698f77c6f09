//! Caller identity verification
//!
//! Every capture endpoint requires a bearer token signed with the project's
//! HS256 secret, carrying the `authenticated` audience and, when an issuer is
//! configured, the project's auth issuer. The `sub` claim is the user id.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::{ApiError, AppState};
use crate::config::AuthConfig;

/// Claims read from a caller token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// User id
    pub sub: String,

    /// Expiration timestamp (Unix epoch)
    pub exp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Verifies caller tokens
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str, audience: &str, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience]);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        validation.set_required_spec_claims(&["exp", "sub", "aud"]);

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validator for the configured secret, if any
    pub fn from_config(config: &AuthConfig) -> Option<Self> {
        config
            .jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|secret| Self::new(secret, &config.audience, config.issuer.as_deref()))
    }

    /// Validate and decode a token
    pub fn validate(&self, token: &str) -> Result<Claims, JwtError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => JwtError::Expired,
                ErrorKind::InvalidSignature => JwtError::InvalidSignature,
                ErrorKind::InvalidAudience => JwtError::InvalidAudience,
                ErrorKind::InvalidIssuer => JwtError::InvalidIssuer,
                _ => JwtError::InvalidFormat(e.to_string()),
            }
        })?;

        if data.claims.sub.trim().is_empty() {
            return Err(JwtError::MissingSubject);
        }
        Ok(data.claims)
    }
}

/// Token verification errors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum JwtError {
    #[error("Authentication required")]
    Missing,

    #[error("Authentication is not configured")]
    NotConfigured,

    #[error("Token has expired")]
    Expired,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Token audience mismatch")]
    InvalidAudience,

    #[error("Token issuer mismatch")]
    InvalidIssuer,

    #[error("Token has no subject")]
    MissingSubject,

    #[error("Invalid token format: {0}")]
    InvalidFormat(String),
}

/// Verified caller, extracted from the `Authorization` header
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub user_id: String,
    pub email: Option<String>,
}

#[async_trait]
impl FromRequestParts<AppState> for CallerIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let validator = state.validator.as_ref().ok_or(JwtError::NotConfigured)?;

        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .ok_or(JwtError::Missing)?;

        let claims = validator.validate(token).map_err(|e| {
            debug!(error = %e, "Rejected caller token");
            e
        })?;

        Ok(CallerIdentity {
            user_id: claims.sub,
            email: claims.email,
        })
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
