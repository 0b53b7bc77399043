use crate::error::StoreError;
use crate::models::{Chunk, Document, DocumentPage, LexicalQuery, QueryFilters, ScoredChunk};
use async_trait::async_trait;

/// Holds one structured record per document. Every write is a
/// single-document replace.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert_document(&self, document: &Document) -> Result<(), StoreError>;

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, StoreError>;

    /// Field filters are exact; keywords match title, summary, entities and
    /// categories. Results are ordered by match strength, then id.
    async fn query_lexical(&self, query: &LexicalQuery) -> Result<Vec<Document>, StoreError>;

    async fn list_documents(&self, page: usize, per_page: usize) -> Result<DocumentPage, StoreError>;

    /// Removes every record whose source path starts with `path_prefix` and
    /// returns the removed ids.
    async fn delete_by_prefix(&self, path_prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

/// Holds one embedding entry per chunk.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Swaps the full chunk set of `document_id` for `chunks`. A concurrent
    /// query sees the old set, the new set or (transiently) nothing, never a
    /// mix. An empty `chunks` deletes the document's entries.
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<(), StoreError>;

    /// Top `k` chunks by descending similarity, ties ordered by document id.
    async fn query_nearest(
        &self,
        embedding: &[f32],
        k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<ScoredChunk>, StoreError>;

    /// Current chunk set of one document ordered by ordinal.
    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}
