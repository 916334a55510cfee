use crate::config::Config;
use crate::error::ThrottlerResult;
use crate::handlers::{health_check, placeholder, AppState};
use crate::middleware::logging_middleware;
use crate::rate_limiter::RateLimiter;
use crate::store::MemoryStore;
use crate::throttler::{throttle_middleware, ThrottleGate};
use axum::routing::get;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the router with the throttle gate in front of every route.
pub fn create_app(state: AppState) -> Router {
    let gate = Arc::clone(&state.gate);

    Router::new()
        .route("/health", get(health_check))
        .fallback(placeholder)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.gate),
            throttle_middleware,
        ))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn_with_state(gate, logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new(config: &Config) -> ThrottlerResult<Self> {
        config.validate()?;

        let rules = config.rule_table()?;
        let store = MemoryStore::new(config.store_capacity, config.store_ttl())?;
        let gate = ThrottleGate::new(rules, RateLimiter::new(Arc::new(store)));

        for rule in gate.rules().rules() {
            tracing::info!(
                pattern = %rule.pattern,
                key_prefix = %rule.key_prefix,
                max_requests = rule.policy.max_requests,
                window = ?rule.policy.window,
                "Throttle rule loaded"
            );
        }

        Ok(Self {
            app: create_app(AppState::new(Arc::new(gate))),
            bind_addr: config.bind_addr,
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Throttle gateway listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");

        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install signal handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
