use std::sync::Arc;

pub mod ai;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod routes;
pub mod storage;

use ai::GeminiClient;
use config::AppConfig;
use pipeline::RagPipeline;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pipeline: Arc<RagPipeline>,
    pub ai_client: Arc<GeminiClient>,
}
