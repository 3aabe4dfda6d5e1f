use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::ai::AnswerGenerator;
use crate::error::RagError;
use crate::storage::{ChunkRecord, VectorStorage};

use super::{
    chunker::{CharacterChunker, ChunkConfig, Chunker},
    extractor::{DocumentExtractor, DocumentKind, StandardDocumentExtractor},
    prompt::build_prompt,
    retriever::Retriever,
};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub collection: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            collection: "pdf_collection".to_string(),
            chunk_size: 500,
            chunk_overlap: 50,
            top_k: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub collection: String,
    pub chunk_count: usize,
}

/// Composes extraction, chunking, storage, retrieval and generation into the
/// two request-scoped operations. Owns no persistent state; the vector store
/// handle is injected at construction.
pub struct RagPipeline {
    store: Arc<dyn VectorStorage>,
    generator: Arc<dyn AnswerGenerator>,
    extractor: Arc<dyn DocumentExtractor>,
    chunker: Arc<dyn Chunker>,
    retriever: Retriever,
    config: PipelineConfig,
    ingest_lock: Mutex<()>,
}

impl RagPipeline {
    pub fn new(
        store: Arc<dyn VectorStorage>,
        generator: Arc<dyn AnswerGenerator>,
        config: PipelineConfig,
    ) -> Self {
        Self::with_dependencies(
            store,
            generator,
            Arc::new(StandardDocumentExtractor),
            Arc::new(CharacterChunker),
            config,
        )
    }

    pub fn with_dependencies(
        store: Arc<dyn VectorStorage>,
        generator: Arc<dyn AnswerGenerator>,
        extractor: Arc<dyn DocumentExtractor>,
        chunker: Arc<dyn Chunker>,
        config: PipelineConfig,
    ) -> Self {
        let retriever = Retriever::new(store.clone(), config.collection.clone(), Some(config.top_k));
        Self {
            store,
            generator,
            extractor,
            chunker,
            retriever,
            config,
            ingest_lock: Mutex::new(()),
        }
    }

    /// Extract, chunk and replace the active collection wholesale. Concurrent
    /// ingests serialize on the lock; a failure leaves the previously
    /// published collection untouched.
    pub async fn ingest(
        &self,
        bytes: &[u8],
        kind: DocumentKind,
        filename: &str,
    ) -> Result<IngestReport, RagError> {
        let _guard = self.ingest_lock.lock().await;

        let text = self.extractor.extract(bytes, kind)?;

        let chunk_config = ChunkConfig {
            chunk_size: self.config.chunk_size,
            chunk_overlap: self.config.chunk_overlap,
        };
        let chunks = self.chunker.chunk(&text, &chunk_config)?;
        if chunks.is_empty() {
            return Err(RagError::Extraction(
                "document produced no chunks".to_string(),
            ));
        }

        let records: Vec<ChunkRecord> = chunks
            .into_iter()
            .map(|chunk| ChunkRecord {
                id: chunk.id,
                content: chunk.content,
                chunk_index: chunk.index,
            })
            .collect();

        let chunk_count = self
            .store
            .replace_collection(&self.config.collection, records)
            .await?;

        info!(
            filename,
            collection = %self.config.collection,
            chunk_count,
            "document ingested"
        );

        Ok(IngestReport {
            collection: self.config.collection.clone(),
            chunk_count,
        })
    }

    /// Retrieve the nearest chunks and forward them with the question to the
    /// answer generator. The generated text is returned verbatim.
    pub async fn answer(&self, question: &str) -> Result<String, RagError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::InvalidInput(
                "question must not be empty".to_string(),
            ));
        }

        let chunks = match self.retriever.retrieve(question).await {
            Ok(chunks) => chunks,
            Err(RagError::CollectionNotFound(_)) => return Err(RagError::NoCorpusIngested),
            Err(err) => return Err(err),
        };

        let prompt = build_prompt(&chunks, question);

        self.generator
            .generate(&prompt)
            .await
            .map_err(|err| RagError::Generation(err.to_string()))
    }
}
