use std::sync::Arc;

use crate::error::RagError;
use crate::storage::{RetrievedChunk, VectorStorage};

pub const DEFAULT_TOP_K: usize = 4;

/// Thin composition over the vector store: question in, nearest chunks out.
pub struct Retriever {
    store: Arc<dyn VectorStorage>,
    collection: String,
    top_k: usize,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn VectorStorage>,
        collection: impl Into<String>,
        top_k: Option<usize>,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            top_k: top_k.unwrap_or(DEFAULT_TOP_K),
        }
    }

    pub async fn retrieve(&self, question: &str) -> Result<Vec<RetrievedChunk>, RagError> {
        self.store
            .query_nearest(&self.collection, question, self.top_k)
            .await
    }
}
