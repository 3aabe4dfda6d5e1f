use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use backend::{
    AppState,
    ai::GeminiClient,
    config,
    pipeline::{PipelineConfig, RagPipeline},
    routes,
    storage::{LanceVectorStorage, LanceVectorStorageConfig},
};
use dotenvy::dotenv;
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(error = %err, "Backend crashed");
        eprintln!("Backend crashed: {err}");
    }
}

async fn run() -> Result<()> {
    init_tracing();
    dotenv().ok();

    let api_key = env::var("GEMINI_API_KEY")
        .or_else(|_| env::var("GOOGLE_API_KEY"))
        .context("GEMINI_API_KEY (or GOOGLE_API_KEY) not set")?;

    let config = config::load_config()
        .await
        .context("Failed to load application configuration")?;

    let ai_client = Arc::new(GeminiClient::new(
        api_key,
        config.gemini.generation_model.clone(),
        config.gemini.embedding_model.clone(),
        config.gemini.base_url.clone(),
    ));

    let store = LanceVectorStorage::open(
        LanceVectorStorageConfig {
            data_dir: config.storage.data_dir.clone(),
        },
        ai_client.clone(),
    )
    .await
    .context("Failed to open vector store")?;

    let pipeline = Arc::new(RagPipeline::new(
        Arc::new(store),
        ai_client.clone(),
        PipelineConfig {
            collection: config.rag.collection.clone(),
            chunk_size: config.rag.chunk_size,
            chunk_overlap: config.rag.chunk_overlap,
            top_k: config.rag.top_k,
        },
    ));

    let addr_string = format!("{}:{}", config.server.host, config.server.port);
    let addr = addr_string
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid server address: {addr_string}"))?;
    info!(host = %config.server.host, port = config.server.port, "Loaded configuration");

    let state = Arc::new(AppState {
        config: Arc::new(config),
        pipeline,
        ai_client,
    });

    let app = Router::new()
        .route("/", get(home))
        .route("/health", get(health))
        .merge(routes::document_routes())
        .merge(routes::chat_routes())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind TCP listener on {addr}"))?;
    info!(%addr, "Backend server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server encountered a fatal error")?;
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[inline]
async fn home() -> &'static str {
    "RAG backend is running"
}

#[inline]
async fn health() -> &'static str {
    "ok"
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                if stream.recv().await.is_some() {
                    info!("Received SIGTERM");
                }
            }
            Err(err) => warn!(error = %err, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received termination signal (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received termination signal (SIGTERM)");
        }
    }
}
