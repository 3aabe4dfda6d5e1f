use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::post};
use serde::{Deserialize, Serialize};

use crate::{AppState, ai::AnswerGenerator, error::RagError};

#[derive(Deserialize)]
struct RagChatRequest {
    question: Option<String>,
}

#[derive(Deserialize)]
struct GeminiChatRequest {
    prompt: Option<String>,
}

#[derive(Serialize)]
struct ChatResponse {
    answer: String,
}

pub fn chat_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/rag-chat", post(rag_chat))
        .route("/api/chat", post(direct_chat))
        .route("/api/gemini-chat", post(gemini_chat))
}

async fn rag_chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RagChatRequest>,
) -> Result<Json<ChatResponse>, RagError> {
    let question = request
        .question
        .ok_or_else(|| RagError::InvalidInput("question is required".to_string()))?;

    let answer = state.pipeline.answer(&question).await?;
    Ok(Json(ChatResponse { answer }))
}

/// Legacy endpoint: same request shape as `rag-chat` but answers without
/// retrieval.
async fn direct_chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RagChatRequest>,
) -> Result<Json<ChatResponse>, RagError> {
    let question = request
        .question
        .ok_or_else(|| RagError::InvalidInput("question is required".to_string()))?;
    generate_direct(&state, &question).await
}

async fn gemini_chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GeminiChatRequest>,
) -> Result<Json<ChatResponse>, RagError> {
    let prompt = request
        .prompt
        .ok_or_else(|| RagError::InvalidInput("prompt is required".to_string()))?;
    generate_direct(&state, &prompt).await
}

async fn generate_direct(state: &AppState, prompt: &str) -> Result<Json<ChatResponse>, RagError> {
    if prompt.trim().is_empty() {
        return Err(RagError::InvalidInput("prompt must not be empty".to_string()));
    }

    let answer = state
        .ai_client
        .generate(prompt)
        .await
        .map_err(|err| RagError::Generation(err.to_string()))?;
    Ok(Json(ChatResponse { answer }))
}
