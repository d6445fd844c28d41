//! skypool -- multi-account Anthropic-compatible proxy over Cloud Code.
//!
//! Entry point: configuration from the environment, tracing setup, state
//! wiring, and the HTTP server with graceful shutdown.

use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use skypool::api;
use skypool::config::Config;
use skypool::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        strategy = ?config.strategy,
        fallback = config.fallback_model.as_deref().unwrap_or("disabled"),
        "Starting skypool"
    );

    if config.api_key.is_none() {
        tracing::warn!("API_KEY is not set -- the /v1 surface is open");
    }

    let listen_addr = config.listen_addr();
    let state = AppState::build(config).await;

    if state.pool.is_empty().await {
        tracing::warn!("No accounts configured; requests will fail until identities are added");
    }

    let app = api::build_router(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down gracefully");
    Ok(())
}

/// Set up the tracing subscriber. `RUST_LOG` wins; `DEBUG=true` raises the
/// default level.
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if config.debug { "debug" } else { "info" };
        EnvFilter::new(format!("skypool={level},tower_http=warn,warn"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C)");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
