mod error;
mod handlers;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use anima_core::embeddings::HttpEmbedder;
use anima_core::llm::OpenAiCompatClient;
use anima_core::{AnimaConfig, AnimaEngine};

use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,anima_core=debug")),
        )
        .init();

    let config = match std::env::var("ANIMA_CONFIG") {
        Ok(path) => AnimaConfig::from_file(&PathBuf::from(path))
            .map_err(|e| anyhow::anyhow!("config error: {}", e))?,
        Err(_) => AnimaConfig::default(),
    };
    tracing::info!(data_dir = %config.data_dir.display(), "Starting anima-server");

    let embedder = Arc::new(HttpEmbedder::new(&config.embedding)?);
    let llm = Arc::new(OpenAiCompatClient::new(&config.llm)?);
    let engine = Arc::new(AnimaEngine::new(config, embedder, llm).await?);

    let app = handlers::router(AppState::new(engine))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = std::env::var("ANIMA_ADDR").unwrap_or_else(|_| "0.0.0.0:8087".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Listening");
    axum::serve(listener, app).await?;

    Ok(())
}
