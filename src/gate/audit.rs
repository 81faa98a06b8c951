//! Audit trail for gate decisions.
//!
//! Every event is serialized to JSON and emitted via `tracing` with the blob
//! in the `audit` field, so it can be extracted by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `auth.bypassed` | Trusted caller marker or bypass sentinel skipped all checks |
//! | `auth.allowed` | A credential was accepted and the request forwarded |
//! | `auth.validated` | A token was introspected and the cache refreshed |
//! | `auth.rejected` | The request was refused (always recorded before the response) |

use axum::http::request::Parts;
use serde::Serialize;

use super::identity::ValidatedIdentity;
use super::{AuthScheme, AuthenticatedUser, BypassKind};
use crate::error::AuthError;

/// `auth.bypassed`
pub const EVENT_BYPASSED: &str = "auth.bypassed";
/// `auth.allowed`
pub const EVENT_ALLOWED: &str = "auth.allowed";
/// `auth.validated`
pub const EVENT_VALIDATED: &str = "auth.validated";
/// `auth.rejected`
pub const EVENT_REJECTED: &str = "auth.rejected";

/// Structured audit event
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditEvent {
    /// Event type string (e.g. `"auth.rejected"`)
    pub event: &'static str,
    /// Credential scheme involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<AuthScheme>,
    /// Resolved user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Request method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Response status for rejections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Correlation reference returned to the caller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Reason for bypasses and rejections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn for_request(event: &'static str, parts: &Parts) -> Self {
        Self {
            event,
            scheme: None,
            user_id: None,
            method: Some(parts.method.to_string()),
            path: Some(parts.uri.path().to_string()),
            status: None,
            reference: None,
            reason: None,
        }
    }

    /// Construct an `auth.bypassed` event
    #[must_use]
    pub fn bypassed(kind: BypassKind, parts: &Parts) -> Self {
        Self {
            reason: Some(kind.as_str().to_string()),
            ..Self::for_request(EVENT_BYPASSED, parts)
        }
    }

    /// Construct an `auth.allowed` event
    #[must_use]
    pub fn allowed(user: &AuthenticatedUser, parts: &Parts) -> Self {
        Self {
            scheme: Some(user.scheme),
            user_id: Some(user.subject.clone()),
            ..Self::for_request(EVENT_ALLOWED, parts)
        }
    }

    /// Construct an `auth.validated` event (no request context)
    #[must_use]
    pub fn validated(identity: &ValidatedIdentity) -> Self {
        Self {
            event: EVENT_VALIDATED,
            scheme: Some(AuthScheme::Sso),
            user_id: Some(identity.user_id.clone()),
            method: None,
            path: None,
            status: None,
            reference: None,
            reason: identity.grant.is_none().then(|| "no grant conferred".to_string()),
        }
    }

    /// Construct an `auth.rejected` event
    #[must_use]
    pub fn rejected(error: &AuthError, reference: &str, parts: &Parts) -> Self {
        Self {
            status: Some(error.status().as_u16()),
            reference: Some(reference.to_string()),
            reason: Some(error.reason().to_string()),
            ..Self::for_request(EVENT_REJECTED, parts)
        }
    }
}

/// Destination for audit events. Recording is best effort and never fails
/// the request.
pub trait AuditSink: Send + Sync + 'static {
    /// Record one event
    fn record(&self, event: &AuditEvent);
}

/// Sink that emits through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        emit(event);
    }
}

/// Emit an audit event via `tracing` with structured fields.
///
/// Rejections are logged at `warn`, everything else at `info`:
///
/// ```text
/// WARN sso_gate::gate::audit: auth audit audit={"event":"auth.rejected",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) if event.event == EVENT_REJECTED => {
            tracing::warn!(audit = %json, "auth audit");
        }
        Ok(ref json) => tracing::info!(audit = %json, "auth audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;

    use super::*;

    fn parts() -> Parts {
        Request::builder()
            .method("POST")
            .uri("/orders?x=1")
            .body(Body::empty())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn rejected_event_carries_status_and_reference() {
        // GIVEN/WHEN: a permission rejection
        let event = AuditEvent::rejected(
            &AuthError::forbidden("no grant for user"),
            "ref-9",
            &parts(),
        );

        // THEN: request context and outcome are captured, query string is not
        assert_eq!(event.event, EVENT_REJECTED);
        assert_eq!(event.status, Some(403));
        assert_eq!(event.reference.as_deref(), Some("ref-9"));
        assert_eq!(event.method.as_deref(), Some("POST"));
        assert_eq!(event.path.as_deref(), Some("/orders"));
        assert_eq!(event.reason.as_deref(), Some("no grant for user"));
    }

    #[test]
    fn bypassed_event_names_the_kind() {
        let event = AuditEvent::bypassed(BypassKind::SentinelToken, &parts());

        assert_eq!(event.event, EVENT_BYPASSED);
        assert_eq!(event.reason.as_deref(), Some("sentinel_token"));
        assert!(event.user_id.is_none());
    }

    #[test]
    fn validated_event_flags_missing_grant() {
        let identity = ValidatedIdentity {
            user_id: "u1".to_string(),
            expires_at: Utc::now(),
            provider_expires_at: None,
            grant: None,
        };

        let event = AuditEvent::validated(&identity);

        assert_eq!(event.user_id.as_deref(), Some("u1"));
        assert_eq!(event.reason.as_deref(), Some("no grant conferred"));
        assert!(event.path.is_none());
    }

    #[test]
    fn events_serialize_without_empty_fields() {
        let user = AuthenticatedUser {
            subject: "u1".to_string(),
            scheme: AuthScheme::Sso,
            grant: Some("GET".to_string()),
        };

        let json = serde_json::to_value(AuditEvent::allowed(&user, &parts())).unwrap();

        assert_eq!(json["event"], "auth.allowed");
        assert_eq!(json["scheme"], "sso");
        assert!(json.get("status").is_none());
        assert!(json.get("reference").is_none());
    }

    #[test]
    fn emit_does_not_panic() {
        emit(&AuditEvent::rejected(&AuthError::MissingCredential, "r", &parts()));
        TracingAuditSink.record(&AuditEvent::bypassed(BypassKind::TrustedCaller, &parts()));
    }
}
