use crate::config::{ModelConfig, PipelineConfig};
use crate::embeddings::Embedder;
use crate::error::{ModelError, SearchError, StoreError};
use crate::models::{
    Document, HitOrigin, LexicalQuery, QueryFilters, RankedHit, ScoredChunk, SearchMode,
    SearchOutput,
};
use crate::retry::{read_store_with_retry, with_retry};
use crate::traits::{RecordStore, VectorStore};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Runs lexical, semantic or hybrid retrieval over the two stores.
pub struct HybridRetriever {
    records: Arc<dyn RecordStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    model: ModelConfig,
    store_timeout: Duration,
    top_k: usize,
}

impl HybridRetriever {
    pub fn new(
        records: Arc<dyn RecordStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            records,
            vectors,
            embedder,
            model: config.model.clone(),
            store_timeout: config.ingestion.store_timeout,
            top_k: config.retrieval.top_k.max(1),
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub async fn retrieve(
        &self,
        query: &str,
        mode: SearchMode,
        filters: &QueryFilters,
    ) -> Result<SearchOutput, SearchError> {
        match mode {
            SearchMode::Lexical => self.lexical(query, filters).await.map(SearchOutput::Documents),
            SearchMode::Semantic => self.semantic(query, filters).await.map(SearchOutput::Ranked),
            SearchMode::Hybrid => self.hybrid(query, filters).await.map(SearchOutput::Ranked),
        }
    }

    pub async fn lexical(&self, query: &str, filters: &QueryFilters) -> Result<Vec<Document>, SearchError> {
        ensure_query(query)?;
        let lexical = LexicalQuery::from_text(query, filters.clone(), self.top_k);
        let documents = self
            .read_store("lexical query", || self.records.query_lexical(&lexical))
            .await?;
        debug!(keywords = ?lexical.keywords, matches = documents.len(), "lexical retrieval");
        Ok(documents)
    }

    pub async fn semantic(&self, query: &str, filters: &QueryFilters) -> Result<Vec<RankedHit>, SearchError> {
        let (_, hits) = self.nearest(query, filters).await?;
        Ok(hits
            .iter()
            .map(|hit| RankedHit::from_chunk(hit, HitOrigin::Semantic))
            .collect())
    }

    /// Both retrievals run concurrently. Lexically matched documents are
    /// promoted ahead of purely semantic hits; lexical matches missing from
    /// the semantic top-k follow with their best chunk or their summary.
    pub async fn hybrid(&self, query: &str, filters: &QueryFilters) -> Result<Vec<RankedHit>, SearchError> {
        let (documents, (query_vector, semantic)) =
            tokio::try_join!(self.lexical(query, filters), self.nearest(query, filters))?;

        let in_semantic: HashSet<&str> = semantic
            .iter()
            .map(|hit| hit.chunk.document_id.as_str())
            .collect();

        let mut best_chunks = HashMap::new();
        for document in documents
            .iter()
            .filter(|document| !in_semantic.contains(document.document_id.as_str()))
        {
            let scoped = filters.for_document(&document.document_id);
            if let Some(best) = self
                .read_store("best chunk query", || {
                    self.vectors.query_nearest(&query_vector, 1, &scoped)
                })
                .await?
                .into_iter()
                .next()
            {
                best_chunks.insert(document.document_id.clone(), best);
            }
        }

        let merged = merge_hybrid(&documents, &semantic, &best_chunks);
        debug!(
            lexical = documents.len(),
            semantic = semantic.len(),
            merged = merged.len(),
            "hybrid retrieval"
        );
        Ok(merged)
    }

    async fn nearest(
        &self,
        query: &str,
        filters: &QueryFilters,
    ) -> Result<(Vec<f32>, Vec<ScoredChunk>), SearchError> {
        ensure_query(query)?;
        let query_vector = with_retry(
            "query embedding",
            self.model.retry.transient_retries,
            self.model.request_timeout,
            || self.embedder.embed(query),
            ModelError::Timeout,
            ModelError::is_transient,
        )
        .await
        .map_err(SearchError::EmbeddingUnavailable)?;

        let hits = self
            .read_store("nearest query", || {
                self.vectors.query_nearest(&query_vector, self.top_k, filters)
            })
            .await?;
        Ok((query_vector, hits))
    }

    async fn read_store<T, F, Fut>(&self, label: &'static str, operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        read_store_with_retry(
            label,
            self.model.retry.transient_retries,
            self.store_timeout,
            operation,
        )
        .await
    }
}

fn ensure_query(query: &str) -> Result<(), SearchError> {
    if query.trim().is_empty() {
        return Err(SearchError::Request("query is empty".to_string()));
    }
    Ok(())
}

/// Merges lexical documents (in lexical rank order) with semantic chunk hits
/// (in similarity order).
///
/// 1. semantic hits whose document also matched lexically, origin `Both`;
/// 2. the remaining semantic hits, origin `Semantic`;
/// 3. lexical-only documents, each as its entry in `best_chunks` or, without
///    one, its summary, origin `Lexical`.
pub fn merge_hybrid(
    lexical: &[Document],
    semantic: &[ScoredChunk],
    best_chunks: &HashMap<String, ScoredChunk>,
) -> Vec<RankedHit> {
    let lexical_ids: HashSet<&str> = lexical
        .iter()
        .map(|document| document.document_id.as_str())
        .collect();

    let (boosted, rest): (Vec<&ScoredChunk>, Vec<&ScoredChunk>) = semantic
        .iter()
        .partition(|hit| lexical_ids.contains(hit.chunk.document_id.as_str()));

    let mut merged: Vec<RankedHit> = boosted
        .into_iter()
        .map(|hit| RankedHit::from_chunk(hit, HitOrigin::Both))
        .chain(
            rest.into_iter()
                .map(|hit| RankedHit::from_chunk(hit, HitOrigin::Semantic)),
        )
        .collect();

    let in_semantic: HashSet<&str> = semantic
        .iter()
        .map(|hit| hit.chunk.document_id.as_str())
        .collect();

    for document in lexical
        .iter()
        .filter(|document| !in_semantic.contains(document.document_id.as_str()))
    {
        let hit = match best_chunks.get(&document.document_id) {
            Some(best) => RankedHit::from_chunk(best, HitOrigin::Lexical),
            None => RankedHit::from_summary(document),
        };
        merged.push(hit);
    }

    merged
}
