use crate::{app::AppState, health, http::RouteModule};
use axum::{Router, routing::get};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::TraceLayer;

/// The billing HTTP service
pub struct App {
    router: Router<AppState>,
    state: AppState,
}

impl App {
    /// Creates an App serving only `/health`
    pub fn new(state: AppState) -> Self {
        let router = Router::<AppState>::new().route("/health", get(health::health_handler));
        Self { router, state }
    }

    /// Creates an App with the billing and webhook routes registered
    pub fn with_billing_routes(state: AppState) -> Self {
        Self::new(state)
            .register_module(crate::http::BillingModule)
            .register_module(crate::http::WebhookModule)
    }

    /// Register a route module with the application
    pub fn register_module<M: RouteModule>(mut self, module: M) -> Self {
        self.router = module.register(self.router);
        self
    }

    /// Finish the router: apply state and request tracing
    pub fn into_router(self) -> Router {
        // Router<AppState> is a router missing AppState; with_state makes it servable
        self.router
            .with_state(self.state)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until Ctrl+C or SIGTERM
    pub async fn serve(self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(addr).await?;

        tracing::info!("Server starting on http://{}", addr);
        tracing::info!("Health check available at http://{}/health", addr);

        axum::serve(listener, self.into_router())
            .with_graceful_shutdown(shutdown_signal())
            .await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, starting graceful shutdown");
        },
    }

    // Give connections a grace period to close
    tokio::time::sleep(Duration::from_secs(1)).await;
    tracing::info!("Shutdown complete");
}
