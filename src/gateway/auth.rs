//! Authentication middleware for the SSO gate
//!
//! Two layers:
//! - [`trusted_caller_middleware`] marks requests from configured peer
//!   addresses with [`TrustedCaller`]
//! - [`auth_middleware`] runs the [`AuthGate`] and either forwards the
//!   request or answers with the rejection payload

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::gate::{AuthGate, AuthOutcome, Rejection, TrustedCaller};

/// Authentication middleware
pub async fn auth_middleware(
    State(gate): State<Arc<AuthGate>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if gate.is_public_path(request.uri().path()) {
        debug!(path = %request.uri().path(), "Public path, skipping auth");
        return next.run(request).await;
    }

    let (mut parts, body) = request.into_parts();

    // Form bodies are read up front so an `authorization` field can be seen,
    // then handed on unchanged
    let (form, body) = if gate.needs_form_body(&parts) {
        match axum::body::to_bytes(body, gate.form_body_limit()).await {
            Ok(bytes) => (Some(bytes.clone()), Body::from(bytes)),
            Err(e) => {
                warn!(path = %parts.uri.path(), error = %e, "Unreadable form body");
                return gate
                    .reject(&parts, AuthError::invalid("form body unreadable"))
                    .into_response();
            }
        }
    } else {
        (None, body)
    };

    match gate.authenticate(&parts, form.as_deref()).await {
        Ok(AuthOutcome::Allowed(user)) => {
            debug!(user_id = %user.subject, scheme = ?user.scheme, "Authenticated request");
            // Inject identity for downstream handlers
            parts.extensions.insert(user);
        }
        Ok(AuthOutcome::Bypassed(kind)) => {
            debug!(kind = kind.as_str(), "Authentication bypassed");
            parts.extensions.insert(kind);
        }
        Err(rejection) => return rejection.into_response(),
    }

    next.run(Request::from_parts(parts, body)).await
}

/// Mark requests whose peer address is in `trusted` with [`TrustedCaller`].
///
/// Requests served without connection info are never trusted. Any marker
/// already present is overwritten.
pub async fn trusted_caller_middleware(
    State(trusted): State<Arc<[IpAddr]>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_canonical());

    let is_trusted = peer.is_some_and(|ip| trusted.contains(&ip));
    if is_trusted {
        debug!(peer = ?peer, "Trusted caller");
    }
    request.extensions_mut().insert(TrustedCaller(is_trusted));

    next.run(request).await
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let body = Json(self.error.payload(self.reference));

        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
