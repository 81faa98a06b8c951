//! SSO Gate Library
//!
//! Request-time authentication and authorization in front of protected HTTP
//! operations.
//!
//! # Features
//!
//! - **SSO tokens**: resolved to a user id through an identity provider's
//!   introspection endpoint, cached with a fixed lifetime
//! - **Grant check**: membership in one configured group earns one grant,
//!   checked on every request
//! - **OAuth2 bearer tokens**: verified as JWTs against a shared secret or JWKS
//! - **Bypass**: trusted peer addresses and a configured sentinel token
//! - **Fail closed**: every rejection is a 401 or 403 with the same payload
//!   shape and an audit record

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod oauth;
pub mod provider;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`. `format` is `text` (default) or `json`.
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
