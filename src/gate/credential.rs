//! Credential classification.
//!
//! Looks at a request and decides which scheme, if any, it presents. Order
//! of precedence: trusted-caller marker, SSO header, OAuth2 bearer
//! (`Authorization` header, then `authorization` query or form field).

use axum::http::{HeaderMap, HeaderName, header, request::Parts};

use crate::{Error, Result};

/// Name of the query/form field that may carry an OAuth2 bearer token
pub const AUTHORIZATION_PARAM: &str = "authorization";

/// Request extension set by an upstream network-restriction layer.
///
/// The gate never computes this itself; `TrustedCaller(true)` means the
/// request arrived from a network location allowed to skip authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrustedCaller(pub bool);

/// Credential scheme presented by a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Upstream marked the caller as trusted
    Bypass,
    /// SSO token from the configured header
    SsoToken(String),
    /// OAuth2 bearer token in a header, query or form field
    OAuthBearer,
    /// Nothing usable
    NoCredential,
}

/// Classifies requests by credential scheme
#[derive(Debug, Clone)]
pub struct CredentialExtractor {
    sso_header: HeaderName,
}

impl CredentialExtractor {
    /// Create an extractor reading SSO tokens from `sso_header`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `sso_header` is not a valid header name.
    pub fn new(sso_header: &str) -> Result<Self> {
        let sso_header = HeaderName::from_bytes(sso_header.trim().as_bytes())
            .map_err(|e| Error::Config(format!("Invalid SSO header '{sso_header}': {e}")))?;
        Ok(Self { sso_header })
    }

    /// Header carrying SSO tokens
    #[must_use]
    pub fn sso_header(&self) -> &HeaderName {
        &self.sso_header
    }

    /// Classify a request. `form` is the buffered body of a form-encoded
    /// request, when the caller chose to buffer it.
    #[must_use]
    pub fn classify(&self, parts: &Parts, form: Option<&[u8]>) -> Credential {
        if parts
            .extensions
            .get::<TrustedCaller>()
            .is_some_and(|marker| marker.0)
        {
            return Credential::Bypass;
        }

        if let Some(value) = parts.headers.get(&self.sso_header) {
            // A present but blank or non-text SSO header is not a credential
            return match value.to_str().map(str::trim) {
                Ok(token) if !token.is_empty() => Credential::SsoToken(token.to_string()),
                _ => Credential::NoCredential,
            };
        }

        if parts.headers.contains_key(header::AUTHORIZATION)
            || parts.uri.query().is_some_and(|q| has_authorization_param(q.as_bytes()))
            || form.is_some_and(has_authorization_param)
        {
            return Credential::OAuthBearer;
        }

        Credential::NoCredential
    }

    /// Whether the body must be buffered to classify this request: it is
    /// form-encoded and nothing outside the body carries a credential.
    #[must_use]
    pub fn needs_form_body(&self, parts: &Parts) -> bool {
        is_form_encoded(&parts.headers)
            && !parts.headers.contains_key(&self.sso_header)
            && !parts.headers.contains_key(header::AUTHORIZATION)
            && !parts
                .uri
                .query()
                .is_some_and(|q| has_authorization_param(q.as_bytes()))
            && !parts
                .extensions
                .get::<TrustedCaller>()
                .is_some_and(|marker| marker.0)
    }
}

/// Whether `encoded` (query string or form body) has an `authorization`
/// field, compared case-insensitively
#[must_use]
pub fn has_authorization_param(encoded: &[u8]) -> bool {
    authorization_param(encoded).is_some()
}

/// Value of the `authorization` field in `encoded`, if any
#[must_use]
pub fn authorization_param(encoded: &[u8]) -> Option<String> {
    url::form_urlencoded::parse(encoded)
        .find(|(name, _)| name.eq_ignore_ascii_case(AUTHORIZATION_PARAM))
        .map(|(_, value)| value.into_owned())
}

/// Whether the request body is `application/x-www-form-urlencoded`
#[must_use]
pub fn is_form_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| {
            mime.trim()
                .eq_ignore_ascii_case("application/x-www-form-urlencoded")
        })
}
