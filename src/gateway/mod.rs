//! HTTP surface: axum middleware, router and server

pub mod auth;
mod router;
mod server;

pub use auth::{auth_middleware, trusted_caller_middleware};
pub use router::create_router;
pub use server::GateServer;
