//! Error types for the SSO gate
//!
//! Two layers live here:
//!
//! - [`Error`]: failures of the gate's collaborators (configuration, the
//!   key/value store, the identity provider, I/O).
//! - [`AuthError`]: the request-level rejection kinds. Every rejection the
//!   gate produces is one of these, and each maps to the same wire payload
//!   ([`ErrorPayload`]) with a 401 or 403 status.

use std::io;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for the SSO gate
pub type Result<T> = std::result::Result<T, Error>;

/// Message returned for every authentication failure (401)
pub const AUTHENTICATION_FAILED: &str =
    "Authentication failed, due to missing or invalid credentials.";

/// Message returned for every permission failure (403)
pub const PERMISSION_DENIED: &str =
    "Authorized requestor does not have required grant for this operation.";

/// SSO gate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key/value store error
    #[error("Store error: {0}")]
    Store(String),

    /// Identity provider rejected the call or answered with an error status
    #[error("Identity provider error: {0}")]
    Provider(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Request-level authentication/authorization failure.
///
/// The string carried by the variants is a short reason that ends up in the
/// `info` field of the payload. It never contains the credential itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No credential of any supported scheme was presented
    #[error("missing credential")]
    MissingCredential,

    /// Expired, unresolvable or provider-rejected token, or failed OAuth2 verification
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// The resolved identity does not hold the required grant
    #[error("insufficient permission: {0}")]
    InsufficientPermission(String),
}

impl AuthError {
    /// Shorthand for [`AuthError::InvalidCredential`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidCredential(reason.into())
    }

    /// Shorthand for [`AuthError::InsufficientPermission`]
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::InsufficientPermission(reason.into())
    }

    /// HTTP status for this rejection
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingCredential | Self::InvalidCredential(_) => StatusCode::UNAUTHORIZED,
            Self::InsufficientPermission(_) => StatusCode::FORBIDDEN,
        }
    }

    /// Public, stable message for this rejection
    #[must_use]
    pub fn message(&self) -> &'static str {
        match self {
            Self::MissingCredential | Self::InvalidCredential(_) => AUTHENTICATION_FAILED,
            Self::InsufficientPermission(_) => PERMISSION_DENIED,
        }
    }

    /// Short reason, reported as `info`
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::MissingCredential => "missing credential",
            Self::InvalidCredential(reason) | Self::InsufficientPermission(reason) => reason,
        }
    }

    /// Build the wire payload for this rejection
    #[must_use]
    pub fn payload(&self, reference: impl Into<String>) -> ErrorPayload {
        ErrorPayload {
            code: self.status().as_u16(),
            message: self.message().to_string(),
            info: self.reason().to_string(),
            reference: reference.into(),
        }
    }
}

/// JSON body of every rejection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// HTTP status code
    pub code: u16,
    /// Public message
    pub message: String,
    /// Short reason
    pub info: String,
    /// Correlation reference, also present in the audit log
    pub reference: String,
}
