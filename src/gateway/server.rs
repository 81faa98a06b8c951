//! Gate server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::router::create_router;
use crate::config::Config;
use crate::gate::AuthGate;
use crate::{Error, Result};

/// SSO gate server
pub struct GateServer {
    /// Configuration
    config: Config,
    /// Shared gate
    gate: Arc<AuthGate>,
}

impl GateServer {
    /// Create a server with an in-memory identity cache and the configured
    /// HTTP identity provider
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let gate = Arc::new(AuthGate::from_config(&config)?);
        Ok(Self { config, gate })
    }

    /// Run until Ctrl+C or SIGTERM
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound or the server fails.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = create_router(Arc::clone(&self.gate), &self.config.network.trusted_callers);
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("SSO GATE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            sso_header = %self.config.gate.sso_header,
            required_grant = %self.config.gate.required_grant,
            token_lifetime = ?self.config.gate.token_lifetime,
            expired_policy = ?self.config.gate.expired_policy,
            "SSO gate ready"
        );
        info!(environment = %self.config.provider.environment, "Identity provider");
        if self.config.oauth.enabled {
            info!("OAUTH2 bearer tokens accepted");
        }
        if self.config.gate.bypass_token.is_some() {
            warn!("Bypass token configured - requests presenting it skip all checks");
        }
        if !self.config.network.trusted_callers.is_empty() {
            info!(trusted_callers = ?self.config.network.trusted_callers, "Trusted callers");
        }
        info!("============================================================");

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let server = async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
        };

        let drain_timeout = self.config.server.shutdown_timeout;
        let drain_deadline = async move {
            let _ = shutdown_rx.recv().await;
            tokio::time::sleep(drain_timeout).await;
        };

        tokio::select! {
            result = server => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = drain_deadline => {
                warn!(
                    timeout = ?drain_timeout,
                    "Graceful shutdown timed out, dropping connections"
                );
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
