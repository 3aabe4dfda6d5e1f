use async_trait::async_trait;

pub mod gemini;

pub use gemini::GeminiClient;

/// Maps text to fixed-dimension vectors. The same implementation must serve
/// both ingestion and queries so the distance metric stays consistent.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String>;
}
