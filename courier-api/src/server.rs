//! Send API HTTP server

use std::{net::SocketAddr, time::Duration};

use axum::{
    Router,
    routing::{get, post},
};
use courier_common::Signal;
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{ApiConfig, ApiError, handlers, state::AppState};

/// Builds the API routes.
///
/// Exposed separately from [`ApiServer`] so the routes can be driven without
/// a socket.
pub fn router(state: AppState, timeout: Duration) -> Router {
    Router::new()
        .route("/send", post(handlers::send_one))
        .route("/send/bulk", post(handlers::send_bulk))
        .route("/send/campaign", post(handlers::send_campaign))
        .route("/logs", get(handlers::list_logs))
        .route("/logs/{id}", get(handlers::get_log))
        .with_state(state)
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
}

/// Send API HTTP server
#[derive(Debug)]
pub struct ApiServer {
    listener: TcpListener,
    address: SocketAddr,
    router: Router,
}

impl ApiServer {
    /// Bind the API listener
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the configured address fails.
    pub async fn new(config: &ApiConfig, state: AppState) -> Result<Self, ApiError> {
        let bind_error = |source| ApiError::Bind {
            address: config.listen_address.to_string(),
            source,
        };

        let listener = TcpListener::bind(config.listen_address)
            .await
            .map_err(bind_error)?;
        let address = listener.local_addr().map_err(bind_error)?;

        tracing::info!(%address, "API server bound successfully");

        Ok(Self {
            listener,
            address,
            router: router(state, config.request_timeout()),
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Run the API server until a shutdown signal is received
    ///
    /// In-flight requests, including running campaigns, are allowed to
    /// finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the server encounters a runtime error.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), ApiError> {
        tracing::info!(address = %self.address, "API server starting");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("API server received shutdown signal");
            })
            .await
            .map_err(|e| ApiError::Server(e.to_string()))?;

        tracing::info!("API server stopped");
        Ok(())
    }
}
