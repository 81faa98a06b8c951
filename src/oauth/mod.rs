//! OAuth2 resource-server verification
//!
//! The gate does not interpret OAuth2 bearer tokens itself: it hands the
//! request to a [`BearerVerifier`] and rejects on any error. The shipped
//! implementation is [`JwtBearerVerifier`], which checks signed JWT access
//! tokens against a shared secret or the issuer's JWKS.

mod jwt;

use async_trait::async_trait;
use axum::http::{header, request::Parts};

use crate::gate::credential::authorization_param;

pub use jwt::{JwksCache, JwtBearerVerifier, VerifyError};

/// Verifies OAuth2 bearer credentials on a request
#[async_trait]
pub trait BearerVerifier: Send + Sync + 'static {
    /// Verify the request's bearer credential and return its subject.
    ///
    /// `form` is the buffered form body, if the request had one.
    async fn verify(&self, parts: &Parts, form: Option<&[u8]>) -> Result<String, VerifyError>;
}

/// Pull the bearer token from the `Authorization` header, or from an
/// `authorization` query/form field. A `Bearer ` prefix is stripped.
#[must_use]
pub fn extract_bearer(parts: &Parts, form: Option<&[u8]>) -> Option<String> {
    let raw = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .or_else(|| {
            parts
                .uri
                .query()
                .and_then(|q| authorization_param(q.as_bytes()))
        })
        .or_else(|| form.and_then(authorization_param))?;

    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .unwrap_or(&raw)
        .trim();

    (!token.is_empty()).then(|| token.to_string())
}
