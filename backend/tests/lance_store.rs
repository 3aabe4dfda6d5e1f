use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use backend::ai::Embedder;
use backend::error::RagError;
use backend::storage::{
    ChunkRecord, LanceVectorStorage, LanceVectorStorageConfig, VectorStorage,
};

struct CharFrequencyEmbedder;

#[async_trait]
impl Embedder for CharFrequencyEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; 8];
                for (i, byte) in text.bytes().enumerate() {
                    vector[i % 8] += (byte as f32) / 255.0;
                }
                let norm = vector
                    .iter()
                    .map(|x| x * x)
                    .sum::<f32>()
                    .sqrt()
                    .max(1e-6);
                vector.iter().map(|x| x / norm).collect()
            })
            .collect())
    }
}

struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Err(anyhow::anyhow!("embedding backend offline"))
    }
}

fn records(texts: &[&str]) -> Vec<ChunkRecord> {
    texts
        .iter()
        .enumerate()
        .map(|(index, text)| ChunkRecord {
            id: format!("chunk-{index}"),
            content: text.to_string(),
            chunk_index: index,
        })
        .collect()
}

async fn open_store(dir: &TempDir, embedder: Arc<dyn Embedder>) -> LanceVectorStorage {
    LanceVectorStorage::open(
        LanceVectorStorageConfig {
            data_dir: dir.path().to_path_buf(),
        },
        embedder,
    )
    .await
    .expect("open vector store")
}

#[tokio::test]
async fn replace_and_query_roundtrip() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, Arc::new(CharFrequencyEmbedder)).await;

    let stored = records(&[
        "the quick brown fox",
        "jumps over the lazy dog",
        "and runs into the forest",
    ]);
    let count = store
        .replace_collection("pdf_collection", stored.clone())
        .await
        .unwrap();
    assert_eq!(count, 3);
    assert!(store.collection_exists("pdf_collection").await.unwrap());

    let rows = store
        .query_nearest("pdf_collection", "quick brown fox", 2)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    let stored_contents: Vec<&str> = stored.iter().map(|r| r.content.as_str()).collect();
    for row in &rows {
        assert!(stored_contents.contains(&row.content.as_str()));
    }

    let distances: Vec<f32> = rows.iter().map(|row| row.distance).collect();
    assert!(distances.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test]
async fn querying_an_unknown_collection_fails() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, Arc::new(CharFrequencyEmbedder)).await;

    let result = store.query_nearest("pdf_collection", "anything", 4).await;
    assert!(matches!(result, Err(RagError::CollectionNotFound(_))));
    assert!(!store.collection_exists("pdf_collection").await.unwrap());
}

#[tokio::test]
async fn replacement_swaps_out_the_previous_corpus() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, Arc::new(CharFrequencyEmbedder)).await;

    store
        .replace_collection(
            "pdf_collection",
            records(&["alpha one", "alpha two", "alpha three"]),
        )
        .await
        .unwrap();
    store
        .replace_collection("pdf_collection", records(&["beta one", "beta two"]))
        .await
        .unwrap();

    let rows = store
        .query_nearest("pdf_collection", "one", 10)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert!(row.content.starts_with("beta"));
    }
}

#[tokio::test]
async fn collections_survive_a_restart() {
    let dir = TempDir::new().unwrap();

    {
        let store = open_store(&dir, Arc::new(CharFrequencyEmbedder)).await;
        store
            .replace_collection("pdf_collection", records(&["persisted body"]))
            .await
            .unwrap();
    }

    let reopened = open_store(&dir, Arc::new(CharFrequencyEmbedder)).await;
    assert!(reopened.collection_exists("pdf_collection").await.unwrap());

    let rows = reopened
        .query_nearest("pdf_collection", "persisted", 4)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].content, "persisted body");
    assert_eq!(rows[0].chunk_index, 0);
}

#[tokio::test]
async fn a_failed_replacement_keeps_the_previous_collection() {
    let dir = TempDir::new().unwrap();

    let store = open_store(&dir, Arc::new(CharFrequencyEmbedder)).await;
    store
        .replace_collection("pdf_collection", records(&["original corpus"]))
        .await
        .unwrap();
    drop(store);

    let broken = open_store(&dir, Arc::new(FailingEmbedder)).await;
    let result = broken
        .replace_collection("pdf_collection", records(&["replacement corpus"]))
        .await;
    assert!(matches!(result, Err(RagError::Storage(_))));
    drop(broken);

    let reopened = open_store(&dir, Arc::new(CharFrequencyEmbedder)).await;
    let rows = reopened
        .query_nearest("pdf_collection", "corpus", 4)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].content, "original corpus");
}

#[tokio::test]
async fn empty_replacements_are_refused() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, Arc::new(CharFrequencyEmbedder)).await;

    let result = store.replace_collection("pdf_collection", Vec::new()).await;
    assert!(matches!(result, Err(RagError::Storage(_))));
    assert!(!store.collection_exists("pdf_collection").await.unwrap());
}
