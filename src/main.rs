use axum::{Router, routing::get};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer,
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};

use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use apdu_relay::{config::Config, handlers, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    tracing::info!("✅ Configuration loaded successfully");

    let state = AppState::new(&config).await?;
    tracing::info!("✅ AppState initialized");

    let tasks = state.spawn_background_tasks();
    tracing::info!(tasks = tasks.len(), "✅ Background tasks started");

    let app = Router::new()
        .route("/ws/relay", get(handlers::relay::relay_socket))
        .route("/health", get(handlers::relay::health))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::default().include_headers(false))
                        .on_request(DefaultOnRequest::default().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::default().level(Level::DEBUG))
                        .on_failure(DefaultOnFailure::default().level(Level::ERROR)),
                )
                .layer(RequestBodyLimitLayer::new(16 * 1024)),
        )
        .with_state(state.clone());

    let addr = config.bind_addr;
    tracing::info!("🚀 Relay listening on ws://{}/ws/relay", addr);
    tracing::info!("✅ All systems operational");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state.shutdown_token.clone()))
    .await?;

    state.audit.flush().await;
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("👋 Relay stopped");

    Ok(())
}

async fn shutdown_signal(shutdown_token: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("🛑 Shutdown signal received, closing connections");
    shutdown_token.cancel();
}
