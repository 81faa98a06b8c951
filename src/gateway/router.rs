//! HTTP router and handlers

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::Request,
    middleware,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::auth::{auth_middleware, trusted_caller_middleware};
use crate::gate::{AuthGate, AuthenticatedUser, BypassKind};

/// Create the router.
///
/// Layers run outermost first: tracing, panic catching, trusted-caller
/// marking, then the gate itself.
pub fn create_router(gate: Arc<AuthGate>, trusted_callers: &[IpAddr]) -> Router {
    let trusted: Arc<[IpAddr]> = trusted_callers
        .iter()
        .map(IpAddr::to_canonical)
        .collect();

    Router::new()
        .route("/health", get(health_handler))
        .route("/whoami", get(whoami_handler).post(whoami_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&gate),
            auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            trusted,
            trusted_caller_middleware,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(gate)
}

/// Health check handler
async fn health_handler(State(gate): State<Arc<AuthGate>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "pending_validations": gate.pending_validations(),
    }))
}

/// Echo the identity the gate admitted
async fn whoami_handler(request: Request<Body>) -> impl IntoResponse {
    let extensions = request.extensions();

    if let Some(user) = extensions.get::<AuthenticatedUser>() {
        return Json(json!({
            "subject": user.subject,
            "scheme": user.scheme,
            "grant": user.grant,
        }));
    }

    let bypass = extensions.get::<BypassKind>().map(|kind| kind.as_str());
    Json(json!({ "bypass": bypass }))
}
