pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod query;
pub mod retrieval;
pub mod retry;
pub mod source;
pub mod stores;
pub mod synthesis;
pub mod technical;
pub mod traits;

pub use chunking::{build_chunks, normalize_whitespace, split_text, ChunkSpan, ChunkingConfig};
pub use config::{
    IngestionConfig, ModelConfig, PipelineConfig, RetrievalConfig, RetryPolicy,
    DEFAULT_EXTENSIONS, DEFAULT_KNOWN_NAMES_FILE, DEFAULT_MODEL_ENDPOINT,
};
pub use embeddings::{
    cosine_similarity, CharacterNgramEmbedder, Embedder, OpenAiEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{IngestError, ModelError, SearchError, StoreError};
pub use extractor::{parse_extraction, ExtractionInput, MetadataExtractor};
pub use ingest::{FileState, IngestionCoordinator, IngestionReport};
pub use llm::{ChatMessage, LanguageModel, OpenAiChatModel, Prompt, Role};
pub use models::{
    Answer, Chunk, ChunkMetadata, Document, DocumentPage, ExtractionResult, HitOrigin, HitUnit,
    IngestionStatus, LexicalQuery, QueryFilters, RankedHit, ScoredChunk, SearchMode,
    SearchOutput, UNKNOWN,
};
pub use query::QueryEngine;
pub use retrieval::{merge_hybrid, HybridRetriever};
pub use source::{
    decode_text, discover_files, document_id_for, load_known_names, save_known_names, SourceFile,
};
pub use stores::{MemoryRecordStore, MemoryVectorStore, OpenSearchRecordStore, QdrantVectorStore};
pub use synthesis::RagSynthesizer;
pub use technical::{ExifTool, NoTechnicalMetadata, TechnicalMetadataSource};
pub use traits::{RecordStore, VectorStore};
