use crate::config::{PipelineConfig, RetrievalConfig};
use crate::embeddings::Embedder;
use crate::error::SearchError;
use crate::llm::LanguageModel;
use crate::models::{Answer, Document, DocumentPage, QueryFilters, SearchMode, SearchOutput};
use crate::retrieval::HybridRetriever;
use crate::retry::read_store_with_retry;
use crate::synthesis::RagSynthesizer;
use crate::traits::{RecordStore, VectorStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Read-only query surface over the two stores.
pub struct QueryEngine {
    records: Arc<dyn RecordStore>,
    retriever: HybridRetriever,
    synthesizer: RagSynthesizer,
    config: RetrievalConfig,
    store_retries: u32,
    store_timeout: Duration,
}

impl QueryEngine {
    pub fn new(
        records: Arc<dyn RecordStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn LanguageModel>,
        config: &PipelineConfig,
    ) -> Result<Self, SearchError> {
        Ok(Self {
            retriever: HybridRetriever::new(Arc::clone(&records), vectors, embedder, config),
            synthesizer: RagSynthesizer::new(model, &config.model, config.retrieval.context_k)?,
            records,
            config: config.retrieval.clone(),
            store_retries: config.model.retry.transient_retries,
            store_timeout: config.ingestion.store_timeout,
        })
    }

    pub fn default_mode(&self) -> SearchMode {
        self.config.default_mode
    }

    /// Lexical mode returns whole documents; the other modes return ranked
    /// chunk or summary hits.
    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        filters: &QueryFilters,
    ) -> Result<SearchOutput, SearchError> {
        let output = self.retriever.retrieve(query, mode, filters).await?;
        info!(mode = %mode, results = output.len(), "search");
        Ok(output)
    }

    /// Retrieves with the default mode (hybrid when the default is lexical,
    /// since synthesis needs ranked passages) and answers from the hits.
    pub async fn ask(&self, query: &str, filters: &QueryFilters) -> Result<Answer, SearchError> {
        let hits = match self.default_mode() {
            SearchMode::Semantic => self.retriever.semantic(query, filters).await?,
            SearchMode::Lexical | SearchMode::Hybrid => self.retriever.hybrid(query, filters).await?,
        };

        let answer = self.synthesizer.synthesize(query, hits).await?;
        info!(
            hits = answer.hits.len(),
            citations = answer.citations.len(),
            answered = answer.answer.is_some(),
            "ask"
        );
        Ok(answer)
    }

    pub async fn browse(&self, page: usize, per_page: usize) -> Result<DocumentPage, SearchError> {
        let listing = read_store_with_retry(
            "record listing",
            self.store_retries,
            self.store_timeout,
            || self.records.list_documents(page, per_page),
        )
        .await?;
        Ok(listing)
    }

    pub async fn document(&self, document_id: &str) -> Result<Option<Document>, SearchError> {
        let document = read_store_with_retry(
            "record lookup",
            self.store_retries,
            self.store_timeout,
            || self.records.get_document(document_id),
        )
        .await?;
        Ok(document)
    }
}
