//! In-process stores.
//!
//! [`MemoryRecordStore`] and [`MemoryVectorStore`] keep everything behind a
//! `tokio` read/write lock. They back the unit and integration tests and
//! single-process use where nothing needs to outlive the run.

use crate::embeddings::cosine_similarity;
use crate::error::StoreError;
use crate::models::{
    newest_first, rank_by_similarity, rank_lexical, Chunk, Document, DocumentPage, LexicalQuery,
    QueryFilters, ScoredChunk,
};
use crate::traits::{RecordStore, VectorStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

const BACKEND: &str = "memory";

#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    documents: Arc<RwLock<BTreeMap<String, Document>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert_document(&self, document: &Document) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        documents.insert(document.document_id.clone(), document.clone());
        debug!(document_id = %document.document_id, status = %document.status, "record upserted");
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.documents.read().await.get(document_id).cloned())
    }

    async fn query_lexical(&self, query: &LexicalQuery) -> Result<Vec<Document>, StoreError> {
        let documents = self.documents.read().await;

        let mut matched: Vec<(usize, Document)> = documents
            .values()
            .filter(|document| query.filters.matches_document(document))
            .filter_map(|document| {
                if query.keywords.is_empty() {
                    return Some((0, document.clone()));
                }
                let score = document.keyword_score(&query.keywords);
                (score > 0).then(|| (score, document.clone()))
            })
            .collect();

        rank_lexical(&mut matched);
        Ok(matched
            .into_iter()
            .take(query.limit)
            .map(|(_, document)| document)
            .collect())
    }

    async fn list_documents(&self, page: usize, per_page: usize) -> Result<DocumentPage, StoreError> {
        let mut all: Vec<Document> = self.documents.read().await.values().cloned().collect();
        all.sort_by(newest_first);
        Ok(DocumentPage::from_sorted(all, page, per_page))
    }

    async fn delete_by_prefix(&self, path_prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut documents = self.documents.write().await;
        let removed: Vec<String> = documents
            .values()
            .filter(|document| document.source_path.starts_with(path_prefix))
            .map(|document| document.document_id.clone())
            .collect();
        for id in &removed {
            documents.remove(id);
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.documents.write().await.clear();
        Ok(())
    }
}

/// Chunk sets are stored per document, so a replacement is a single map
/// insert under the write lock and readers never see two versions.
#[derive(Clone)]
pub struct MemoryVectorStore {
    dimension: usize,
    chunks: Arc<RwLock<BTreeMap<String, Vec<Chunk>>>>,
}

impl MemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            chunks: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub async fn total_chunks(&self) -> usize {
        self.chunks.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<(), StoreError> {
        if let Some(chunk) = chunks.iter().find(|chunk| chunk.document_id != document_id) {
            return Err(StoreError::write(
                BACKEND,
                format!("chunk {} belongs to {}, not {document_id}", chunk.chunk_id, chunk.document_id),
            ));
        }
        if let Some(chunk) = chunks.iter().find(|chunk| chunk.embedding.len() != self.dimension) {
            return Err(StoreError::write(
                BACKEND,
                format!(
                    "embedding dimension {} != {} for chunk {}",
                    chunk.embedding.len(),
                    self.dimension,
                    chunk.chunk_id
                ),
            ));
        }

        let mut store = self.chunks.write().await;
        if chunks.is_empty() {
            store.remove(document_id);
        } else {
            store.insert(document_id.to_string(), chunks.to_vec());
        }
        debug!(document_id, count = chunks.len(), "chunk set replaced");
        Ok(())
    }

    async fn query_nearest(
        &self,
        embedding: &[f32],
        k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if embedding.len() != self.dimension {
            return Err(StoreError::query(
                BACKEND,
                format!("query vector dim {} is not {}", embedding.len(), self.dimension),
            ));
        }

        let store = self.chunks.read().await;
        let mut hits: Vec<ScoredChunk> = store
            .values()
            .flatten()
            .filter(|chunk| filters.matches_chunk(chunk))
            .map(|chunk| ScoredChunk {
                score: cosine_similarity(embedding, &chunk.embedding),
                chunk: chunk.clone(),
            })
            .collect();

        rank_by_similarity(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError> {
        Ok(self
            .chunks
            .read()
            .await
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.chunks.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, IngestionStatus};
    use chrono::{Duration, NaiveDate, Utc};

    fn document(id: &str, title: &str, path: &str) -> Document {
        Document {
            document_id: id.to_string(),
            source_path: path.to_string(),
            file_name: "f.txt".to_string(),
            file_type: "txt".to_string(),
            title: title.to_string(),
            document_set: "council".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 10),
            entities: vec!["Jane Doe".to_string()],
            categories: vec!["parks".to_string()],
            summary: format!("{title} was discussed. Nothing was decided."),
            text: String::new(),
            technical_metadata: BTreeMap::new(),
            status: IngestionStatus::Ingested,
            content_hash: "h".to_string(),
            last_modified: Utc::now(),
            ingested_at: Utc::now(),
        }
    }

    fn chunk(document_id: &str, ordinal: u32, embedding: Vec<f32>) -> Chunk {
        Chunk {
            chunk_id: format!("{document_id}-{ordinal}"),
            document_id: document_id.to_string(),
            ordinal,
            start: 0,
            end: 0,
            text: format!("chunk {ordinal}"),
            embedding,
            metadata: ChunkMetadata {
                title: document_id.to_string(),
                source_path: format!("/docs/{document_id}.txt"),
                document_set: "council".to_string(),
                ..ChunkMetadata::default()
            },
        }
    }

    #[tokio::test]
    async fn upsert_replaces_by_identifier() {
        let store = MemoryRecordStore::new();
        store.upsert_document(&document("a", "Parks levy", "/docs/a.txt")).await.unwrap();
        store.upsert_document(&document("a", "Parks levy v2", "/docs/a.txt")).await.unwrap();

        assert_eq!(store.len().await, 1);
        let stored = store.get_document("a").await.unwrap().unwrap();
        assert_eq!(stored.title, "Parks levy v2");
        assert!(store.get_document("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lexical_query_ranks_by_keyword_hits() {
        let store = MemoryRecordStore::new();
        store.upsert_document(&document("a", "Parks levy", "/docs/a.txt")).await.unwrap();
        store.upsert_document(&document("b", "Library levy hearing", "/docs/b.txt")).await.unwrap();
        store.upsert_document(&document("c", "Zoning", "/docs/c.txt")).await.unwrap();

        let query = LexicalQuery::from_text("library levy", QueryFilters::default(), 10);
        let results = store.query_lexical(&query).await.unwrap();
        let ids: Vec<_> = results.iter().map(|doc| doc.document_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let filtered = LexicalQuery::from_text(
            "levy",
            QueryFilters {
                path_prefix: Some("/docs/a.txt".to_string()),
                ..QueryFilters::default()
            },
            10,
        );
        assert_eq!(store.query_lexical(&filtered).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn listing_is_newest_first_and_paged() {
        let store = MemoryRecordStore::new();
        for (offset, id) in ["a", "b", "c"].iter().enumerate() {
            let mut doc = document(id, "t", "/docs/x.txt");
            doc.ingested_at = Utc::now() + Duration::seconds(offset as i64);
            store.upsert_document(&doc).await.unwrap();
        }

        let page = store.list_documents(1, 2).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.documents[0].document_id, "c");
    }

    #[tokio::test]
    async fn prefix_delete_returns_removed_ids() {
        let store = MemoryRecordStore::new();
        store.upsert_document(&document("a", "t", "/archive/one/a.txt")).await.unwrap();
        store.upsert_document(&document("b", "t", "/archive/two/b.txt")).await.unwrap();

        let removed = store.delete_by_prefix("/archive/one/").await.unwrap();
        assert_eq!(removed, vec!["a"]);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn replace_drops_stale_ordinals() {
        let store = MemoryVectorStore::new(2);
        let old: Vec<_> = (0..4).map(|i| chunk("a", i, vec![1.0, 0.0])).collect();
        store.replace_chunks("a", &old).await.unwrap();

        let new: Vec<_> = (0..2).map(|i| chunk("a", i, vec![0.0, 1.0])).collect();
        store.replace_chunks("a", &new).await.unwrap();

        let current = store.chunks_for_document("a").await.unwrap();
        assert_eq!(current.len(), 2);
        assert!(current.iter().all(|chunk| chunk.embedding == vec![0.0, 1.0]));

        store.replace_chunks("a", &[]).await.unwrap();
        assert_eq!(store.total_chunks().await, 0);
    }

    #[tokio::test]
    async fn replace_rejects_foreign_chunks_and_wrong_dimensions() {
        let store = MemoryVectorStore::new(2);
        assert!(store.replace_chunks("a", &[chunk("b", 0, vec![1.0, 0.0])]).await.is_err());
        assert!(store.replace_chunks("a", &[chunk("a", 0, vec![1.0])]).await.is_err());
    }

    #[tokio::test]
    async fn nearest_query_ranks_and_filters() {
        let store = MemoryVectorStore::new(2);
        store.replace_chunks("a", &[chunk("a", 0, vec![1.0, 0.0])]).await.unwrap();
        store.replace_chunks("b", &[chunk("b", 0, vec![0.6, 0.8])]).await.unwrap();
        store.replace_chunks("c", &[chunk("c", 0, vec![1.0, 0.0])]).await.unwrap();

        let hits = store.query_nearest(&[1.0, 0.0], 2, &QueryFilters::default()).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|hit| hit.chunk.document_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let only_b = QueryFilters::default().for_document("b");
        let hits = store.query_nearest(&[1.0, 0.0], 5, &only_b).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.6).abs() < 1e-6);

        assert!(store.query_nearest(&[1.0], 2, &QueryFilters::default()).await.is_err());
    }
}
