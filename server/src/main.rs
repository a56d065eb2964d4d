use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use voice_server::config::ServerConfig;
use voice_server::registry::SessionRegistry;
use voice_server::routes::build_router;
use voice_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting voice server...");

    let config = ServerConfig::from_env();
    info!(
        "Server configuration loaded: port={}, rate_limit={}/min, llm_timeout={}s, tts={:?}",
        config.port, config.rate_limit_per_minute, config.llm_timeout_secs, config.tts_backend
    );
    if config.llm_api_key.is_empty() {
        warn!("No LLM API key configured; replies will fall back to the apology");
    }

    let state = AppState::from_config(&config).await?;
    let sweeper = state.services.store.spawn_sweeper();
    let registry = state.registry.clone();
    let app = build_router(state)?;

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT.")
    })?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    sweeper.stop().await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(registry: Arc<SessionRegistry>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, closing {} live session(s)", registry.len());
    registry.terminate_all();
}
