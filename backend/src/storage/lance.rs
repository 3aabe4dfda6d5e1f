use std::{path::PathBuf, sync::Arc};

use arrow_array::{
    ArrayRef, FixedSizeListArray, Float32Array, Int32Array, RecordBatch, RecordBatchIterator,
    RecordBatchReader, StringArray, types::Float32Type,
};
use arrow_schema::{ArrowError, DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use futures::StreamExt;
use lancedb::{
    connect,
    connection::Connection,
    query::{ExecutableQuery, QueryBase},
};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ai::Embedder;
use crate::error::RagError;

use super::{
    ChunkRecord, RetrievedChunk, StorageResult, VectorStorage,
    manifest::{CollectionManifest, load_manifest, store_manifest},
};

const MANIFEST_FILE: &str = "collections.json";
const LANCE_DIR: &str = "lancedb";

#[derive(Debug, Clone)]
pub struct LanceVectorStorageConfig {
    pub data_dir: PathBuf,
}

/// LanceDB-backed vector store. Logical collection names are decoupled from
/// physical tables: a replacement builds a fresh table under a suffixed name
/// and repoints the manifest only once the build succeeded, so queries never
/// observe a half-written collection.
pub struct LanceVectorStorage {
    db: Connection,
    embedder: Arc<dyn Embedder>,
    manifest_path: PathBuf,
    manifest: RwLock<CollectionManifest>,
}

impl LanceVectorStorage {
    /// Connects, loads the manifest and clears out tables left behind by an
    /// interrupted swap.
    pub async fn open(
        config: LanceVectorStorageConfig,
        embedder: Arc<dyn Embedder>,
    ) -> StorageResult<Self> {
        let lance_dir = config.data_dir.join(LANCE_DIR);
        tokio::fs::create_dir_all(&lance_dir).await.map_err(|err| {
            RagError::Storage(format!(
                "failed to create data directory {}: {err}",
                lance_dir.display()
            ))
        })?;

        let db = connect(&lance_dir.to_string_lossy()).execute().await?;
        let manifest_path = config.data_dir.join(MANIFEST_FILE);
        let manifest = load_manifest(&manifest_path).await?;

        let store = Self {
            db,
            embedder,
            manifest_path,
            manifest: RwLock::new(manifest),
        };
        store.drop_orphan_tables().await?;
        Ok(store)
    }

    async fn drop_orphan_tables(&self) -> StorageResult<()> {
        let known: Vec<String> = {
            let manifest = self.manifest.read().await;
            manifest.tables().map(str::to_owned).collect()
        };

        for table in self.db.table_names().execute().await? {
            if !known.iter().any(|name| name == &table) {
                warn!(%table, "dropping orphaned vector table");
                if let Err(err) = self.db.drop_table(table.as_str(), &[]).await {
                    warn!(%table, error = %err, "failed to drop orphaned table");
                }
            }
        }
        Ok(())
    }

    async fn embed_records(&self, records: &[ChunkRecord]) -> StorageResult<(Vec<Vec<f32>>, usize)> {
        let texts: Vec<String> = records.iter().map(|record| record.content.clone()).collect();
        let vectors = self
            .embedder
            .embed(&texts)
            .await
            .map_err(|err| RagError::Storage(format!("embedding failed: {err}")))?;

        if vectors.len() != records.len() {
            return Err(RagError::Storage(format!(
                "embedding count mismatch: {} chunks, {} vectors",
                records.len(),
                vectors.len()
            )));
        }

        let dim = vectors.first().map(Vec::len).unwrap_or(0);
        if dim == 0 || vectors.iter().any(|vector| vector.len() != dim) {
            return Err(RagError::Storage(
                "embedding dimensionality is not uniform".to_string(),
            ));
        }

        Ok((vectors, dim))
    }

    fn build_batch(
        records: &[ChunkRecord],
        vectors: &[Vec<f32>],
        dim: usize,
    ) -> Result<(SchemaRef, RecordBatch), ArrowError> {
        let schema: SchemaRef = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
            Field::new("chunk_index", DataType::Int32, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dim as i32,
                ),
                true,
            ),
        ]));

        let ids = StringArray::from_iter_values(records.iter().map(|record| record.id.as_str()));
        let contents =
            StringArray::from_iter_values(records.iter().map(|record| record.content.as_str()));
        let indices =
            Int32Array::from_iter_values(records.iter().map(|record| record.chunk_index as i32));
        let embeddings = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
            vectors
                .iter()
                .map(|vector| Some(vector.iter().copied().map(Some).collect::<Vec<_>>())),
            dim as i32,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(ids),
                Arc::new(contents),
                Arc::new(indices),
                Arc::new(embeddings),
            ],
        )?;
        Ok((schema, batch))
    }

    fn staging_table_name(name: &str) -> String {
        format!("{name}_{}", Uuid::new_v4().simple())
    }
}

#[async_trait]
impl VectorStorage for LanceVectorStorage {
    async fn replace_collection(
        &self,
        name: &str,
        records: Vec<ChunkRecord>,
    ) -> StorageResult<usize> {
        if records.is_empty() {
            return Err(RagError::Storage(
                "refusing to create an empty collection".to_string(),
            ));
        }

        let (vectors, dim) = self.embed_records(&records).await?;
        let (schema, batch) = Self::build_batch(&records, &vectors, dim)
            .map_err(|err| RagError::Storage(format!("failed to build record batch: {err}")))?;

        let staging = Self::staging_table_name(name);
        let reader: Box<dyn RecordBatchReader + Send> =
            Box::new(RecordBatchIterator::new(vec![Ok(batch)], schema));
        self.db
            .create_table(staging.as_str(), reader)
            .execute()
            .await
            .map_err(|err| RagError::Storage(format!("failed to create collection table: {err}")))?;

        // The manifest write is the commit point; the previous table stays
        // queryable until the new one is published.
        let superseded = {
            let mut manifest = self.manifest.write().await;
            let previous = manifest.table_for(name).map(str::to_owned);

            let mut updated = manifest.clone();
            updated.set(name, &staging);
            if let Err(err) = store_manifest(&self.manifest_path, &updated).await {
                drop(manifest);
                if let Err(drop_err) = self.db.drop_table(staging.as_str(), &[]).await {
                    warn!(table = %staging, error = %drop_err, "failed to drop staging table after aborted swap");
                }
                return Err(err);
            }

            *manifest = updated;
            previous
        };

        if let Some(previous) = superseded {
            if let Err(err) = self.db.drop_table(previous.as_str(), &[]).await {
                warn!(table = %previous, error = %err, "failed to drop superseded table");
            }
        }

        info!(collection = name, chunks = records.len(), dim, "collection replaced");
        Ok(records.len())
    }

    async fn query_nearest(
        &self,
        name: &str,
        query_text: &str,
        k: usize,
    ) -> StorageResult<Vec<RetrievedChunk>> {
        let table_name = {
            let manifest = self.manifest.read().await;
            manifest.table_for(name).map(str::to_owned)
        }
        .ok_or_else(|| RagError::CollectionNotFound(name.to_string()))?;

        let query_texts = vec![query_text.to_string()];
        let mut query_vectors = self
            .embedder
            .embed(&query_texts)
            .await
            .map_err(|err| RagError::Storage(format!("query embedding failed: {err}")))?;
        let query_vector = query_vectors
            .pop()
            .ok_or_else(|| RagError::Storage("query embedding missing".to_string()))?;

        let table = self.db.open_table(table_name.as_str()).execute().await?;
        let query_array: ArrayRef = Arc::new(Float32Array::from(query_vector));

        let mut stream = table
            .vector_search(query_array)?
            .limit(k)
            .execute()
            .await?;

        let mut chunks = Vec::new();
        while let Some(batch) = stream.next().await {
            let batch = batch
                .map_err(|err| RagError::Storage(format!("vector search failed: {err}")))?;
            read_result_batch(&batch, &mut chunks)?;
        }
        Ok(chunks)
    }

    async fn collection_exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.manifest.read().await.contains(name))
    }
}

fn read_result_batch(batch: &RecordBatch, out: &mut Vec<RetrievedChunk>) -> StorageResult<()> {
    let ids = column::<StringArray>(batch, "id")?;
    let contents = column::<StringArray>(batch, "content")?;
    let indices = column::<Int32Array>(batch, "chunk_index")?;
    let distances = column::<Float32Array>(batch, "_distance")?;

    out.reserve(batch.num_rows());
    for row in 0..batch.num_rows() {
        out.push(RetrievedChunk {
            id: ids.value(row).to_string(),
            content: contents.value(row).to_string(),
            chunk_index: indices.value(row) as usize,
            distance: distances.value(row),
        });
    }
    Ok(())
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> StorageResult<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<T>())
        .ok_or_else(|| RagError::Storage(format!("result column `{name}` missing or mistyped")))
}
