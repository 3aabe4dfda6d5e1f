use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RagError;

pub mod lance;
pub mod manifest;

pub use lance::{LanceVectorStorage, LanceVectorStorageConfig};

pub type StorageResult<T> = Result<T, RagError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub content: String,
    pub chunk_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub content: String,
    pub chunk_index: usize,
    pub distance: f32,
}

#[async_trait]
pub trait VectorStorage: Send + Sync {
    /// Replace the named collection wholesale with the given chunks and
    /// return how many were stored. The previous contents must stay visible
    /// to queries until the replacement is fully published; on failure the
    /// previous collection remains intact.
    async fn replace_collection(
        &self,
        name: &str,
        records: Vec<ChunkRecord>,
    ) -> StorageResult<usize>;

    /// Return the k chunks nearest to the query text, nearest first. An
    /// existing collection with no close matches yields fewer (possibly
    /// zero) rows; a collection that was never created is
    /// `CollectionNotFound`.
    async fn query_nearest(
        &self,
        name: &str,
        query_text: &str,
        k: usize,
    ) -> StorageResult<Vec<RetrievedChunk>>;

    async fn collection_exists(&self, name: &str) -> StorageResult<bool>;
}
