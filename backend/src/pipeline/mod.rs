pub mod chunker;
pub mod extractor;
pub mod orchestrator;
pub mod prompt;
pub mod retriever;

pub mod utils;

pub use chunker::{CharacterChunker, Chunk, ChunkConfig, Chunker};
pub use extractor::{DocumentExtractor, DocumentKind, StandardDocumentExtractor};
pub use orchestrator::{IngestReport, PipelineConfig, RagPipeline};
pub use retriever::{DEFAULT_TOP_K, Retriever};
