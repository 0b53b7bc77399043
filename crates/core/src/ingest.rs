use crate::chunking::build_chunks;
use crate::config::PipelineConfig;
use crate::embeddings::Embedder;
use crate::error::{IngestError, ModelError, StoreError};
use crate::extractor::{ExtractionInput, MetadataExtractor};
use crate::llm::LanguageModel;
use crate::models::{Chunk, Document, ExtractionResult, IngestionStatus, UNKNOWN};
use crate::retry::{read_store_with_retry, with_retry};
use crate::source::{decode_text, discover_files, document_id_for, load_known_names, SourceFile};
use crate::technical::{NoTechnicalMetadata, TechnicalMetadataSource};
use crate::traits::{RecordStore, VectorStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Last known pipeline position of one source file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileState {
    pub path: PathBuf,
    pub document_id: String,
    pub status: IngestionStatus,
    pub content_hash: Option<String>,
    pub error: Option<String>,
    /// Stage the file was in when it failed.
    pub failed_stage: Option<IngestionStatus>,
    pub updated_at: DateTime<Utc>,
}

impl FileState {
    fn discovered(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            document_id: document_id_for(path),
            status: IngestionStatus::Discovered,
            content_hash: None,
            error: None,
            failed_stage: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionReport {
    pub files: Vec<FileState>,
    pub ingested: usize,
    /// Unchanged files that were already ingested.
    pub skipped: usize,
    pub failed: usize,
    pub excluded: usize,
}

impl IngestionReport {
    pub fn failures(&self) -> impl Iterator<Item = &FileState> {
        self.files
            .iter()
            .filter(|state| state.status == IngestionStatus::Failed)
    }
}

enum Disposition {
    Processed,
    Unchanged,
    Excluded,
}

enum Pending {
    Path(PathBuf),
    Loaded(SourceFile),
}

impl Pending {
    fn path(&self) -> &Path {
        match self {
            Pending::Path(path) => path,
            Pending::Loaded(source) => &source.path,
        }
    }
}

/// Per-document mutual exclusion for the persisting step. Entries nobody
/// holds are pruned on the next acquisition.
#[derive(Default)]
struct DocumentLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DocumentLocks {
    async fn acquire(&self, document_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(document_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Drives each file through extraction, chunking and the record-then-vector
/// dual write, tracking per-file state across scans.
///
/// The two stores share no transaction. The record is written first and the
/// chunk set second; a failed vector write leaves the record in place and the
/// file `Failed`, and the next scan repeats the vector write against an
/// identical record.
pub struct IngestionCoordinator {
    records: Arc<dyn RecordStore>,
    vectors: Arc<dyn VectorStore>,
    extractor: MetadataExtractor,
    embedder: Arc<dyn Embedder>,
    technical: Arc<dyn TechnicalMetadataSource>,
    config: PipelineConfig,
    locks: DocumentLocks,
    ledger: RwLock<HashMap<PathBuf, FileState>>,
    excluded: RwLock<HashSet<PathBuf>>,
}

impl IngestionCoordinator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        vectors: Arc<dyn VectorStore>,
        model: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        config: PipelineConfig,
    ) -> Result<Self, IngestError> {
        config.chunking.validate()?;
        if config.ingestion.workers == 0 {
            return Err(IngestError::InvalidArgument(
                "ingestion needs at least one worker".to_string(),
            ));
        }

        Ok(Self {
            records,
            vectors,
            extractor: MetadataExtractor::new(model, config.model.clone()),
            embedder,
            technical: Arc::new(NoTechnicalMetadata),
            config,
            locks: DocumentLocks::default(),
            ledger: RwLock::new(HashMap::new()),
            excluded: RwLock::new(HashSet::new()),
        })
    }

    pub fn with_technical_metadata(mut self, source: Arc<dyn TechnicalMetadataSource>) -> Self {
        self.technical = source;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Scans `folder` recursively and ingests every supported file, using the
    /// folder's known-names list when present.
    pub async fn ingest_directory(
        self: &Arc<Self>,
        folder: &Path,
    ) -> Result<IngestionReport, IngestError> {
        if !folder.is_dir() {
            return Err(IngestError::InvalidArgument(format!(
                "{} is not a directory",
                folder.display()
            )));
        }

        let known_names = load_known_names(folder, &self.config.ingestion.known_names_file).await?;
        let files = discover_files(folder, &self.config.ingestion);
        info!(
            folder = %folder.display(),
            files = files.len(),
            known_names = known_names.len(),
            "scan started"
        );

        let pending = files.into_iter().map(Pending::Path).collect();
        Ok(self.run_batch(pending, known_names).await)
    }

    /// Ingests files supplied directly by a caller-side directory source.
    pub async fn ingest_sources(
        self: &Arc<Self>,
        sources: Vec<SourceFile>,
        known_names: Vec<String>,
    ) -> IngestionReport {
        let pending = sources.into_iter().map(Pending::Loaded).collect();
        self.run_batch(pending, known_names).await
    }

    async fn run_batch(self: &Arc<Self>, pending: Vec<Pending>, known_names: Vec<String>) -> IngestionReport {
        let known_names = Arc::new(known_names);
        let workers = self.config.ingestion.workers.max(1);
        let mut tasks = JoinSet::new();
        let mut outcomes = Vec::new();

        for item in pending {
            while tasks.len() >= workers {
                collect_next(&mut tasks, &mut outcomes).await;
            }

            let coordinator = Arc::clone(self);
            let known_names = Arc::clone(&known_names);
            tasks.spawn(async move { coordinator.process(item, &known_names).await });
        }
        while !tasks.is_empty() {
            collect_next(&mut tasks, &mut outcomes).await;
        }

        outcomes.sort_by(|(left, _), (right, _)| left.path.cmp(&right.path));

        let mut report = IngestionReport::default();
        for (state, disposition) in outcomes {
            match disposition {
                Disposition::Excluded => report.excluded += 1,
                Disposition::Unchanged => report.skipped += 1,
                Disposition::Processed if state.status == IngestionStatus::Ingested => {
                    report.ingested += 1
                }
                Disposition::Processed => report.failed += 1,
            }
            report.files.push(state);
        }

        info!(
            ingested = report.ingested,
            skipped = report.skipped,
            failed = report.failed,
            excluded = report.excluded,
            "scan finished"
        );
        report
    }

    async fn process(&self, item: Pending, known_names: &[String]) -> (FileState, Disposition) {
        let path = item.path().to_path_buf();
        if self.excluded.read().await.contains(&path) {
            let state = self
                .status(&path)
                .await
                .unwrap_or_else(|| FileState::discovered(&path));
            info!(path = %path.display(), "excluded, not scanned");
            return (state, Disposition::Excluded);
        }

        let source = match item {
            Pending::Loaded(source) => source,
            Pending::Path(path) => match SourceFile::load(&path).await {
                Ok(source) => source,
                Err(error) => {
                    let mut state = FileState::discovered(&path);
                    self.fail(&mut state, IngestionStatus::Discovered, &error).await;
                    return (state, Disposition::Processed);
                }
            },
        };

        self.ingest_file(source, known_names).await
    }

    /// Runs one file through the pipeline regardless of exclusion and
    /// returns its final state.
    pub async fn ingest_source(&self, source: SourceFile, known_names: &[String]) -> FileState {
        self.ingest_file(source, known_names).await.0
    }

    async fn ingest_file(&self, source: SourceFile, known_names: &[String]) -> (FileState, Disposition) {
        let mut state = FileState::discovered(&source.path);
        let content_hash = source.content_hash();
        state.content_hash = Some(content_hash.clone());
        self.record_state(&state).await;

        let document_id = state.document_id.clone();
        let lookup = self
            .read_with_retry("record lookup", || self.records.get_document(&document_id))
            .await;
        let existing = match lookup {
            Ok(existing) => existing.filter(|document| document.content_hash == content_hash),
            Err(error) => {
                self.fail(&mut state, IngestionStatus::Discovered, &IngestError::from(error))
                    .await;
                return (state, Disposition::Processed);
            }
        };

        if let Some(document) = &existing {
            if document.status == IngestionStatus::Ingested {
                state.status = IngestionStatus::Ingested;
                state.updated_at = Utc::now();
                self.record_state(&state).await;
                info!(path = %state.path.display(), document_id = %state.document_id, "unchanged, skipped");
                return (state, Disposition::Unchanged);
            }
        }

        self.transition(&mut state, IngestionStatus::Extracting).await;
        let document = match self.extract(&source, &content_hash, existing, known_names).await {
            Ok(document) => document,
            Err(error) => {
                self.fail(&mut state, IngestionStatus::Extracting, &error).await;
                return (state, Disposition::Processed);
            }
        };

        self.transition(&mut state, IngestionStatus::Chunking).await;
        let chunks = match self.chunk_and_embed(&document).await {
            Ok(chunks) => chunks,
            Err(error) => {
                self.fail(&mut state, IngestionStatus::Chunking, &error).await;
                return (state, Disposition::Processed);
            }
        };

        self.transition(&mut state, IngestionStatus::Persisting).await;
        if let Err(error) = self.persist(document, &chunks).await {
            self.fail(&mut state, IngestionStatus::Persisting, &error).await;
            return (state, Disposition::Processed);
        }

        self.transition(&mut state, IngestionStatus::Ingested).await;
        (state, Disposition::Processed)
    }

    /// Builds the document for this file version. A record left behind by an
    /// interrupted write of the same content is reused instead of asking the
    /// model again.
    async fn extract(
        &self,
        source: &SourceFile,
        content_hash: &str,
        previous: Option<Document>,
        known_names: &[String],
    ) -> Result<Document, IngestError> {
        if let Some(previous) = previous {
            info!(document_id = %previous.document_id, "reusing extracted metadata of unchanged file");
            return Ok(Document {
                ingested_at: Utc::now(),
                ..previous
            });
        }

        let file_name = source.file_name()?;
        let text = decode_text(source)?;
        let technical_metadata = self.technical.extract(&source.path).await;

        let extraction = self
            .extractor
            .extract(&ExtractionInput {
                file_name: &file_name,
                text: &text,
                technical_metadata: &technical_metadata,
                known_names,
            })
            .await?;

        let ExtractionResult {
            title,
            document_set,
            date,
            entities,
            categories,
            summary,
        } = extraction;
        let extension = source.extension();

        Ok(Document {
            document_id: document_id_for(&source.path),
            source_path: source.path.to_string_lossy().to_string(),
            file_name,
            file_type: if extension.is_empty() {
                UNKNOWN.to_string()
            } else {
                extension
            },
            title,
            document_set,
            date,
            entities,
            categories,
            summary,
            text,
            technical_metadata,
            status: IngestionStatus::Persisting,
            content_hash: content_hash.to_string(),
            last_modified: source.last_modified,
            ingested_at: Utc::now(),
        })
    }

    async fn chunk_and_embed(&self, document: &Document) -> Result<Vec<Chunk>, IngestError> {
        let mut chunks = build_chunks(document, &self.config.chunking)?;
        let model = &self.config.model;

        for chunk in chunks.iter_mut() {
            let text = chunk.text.as_str();
            let embedding = with_retry(
                "chunk embedding",
                model.retry.transient_retries,
                model.request_timeout,
                || self.embedder.embed(text),
                ModelError::Timeout,
                ModelError::is_transient,
            )
            .await
            .map_err(IngestError::EmbeddingUnavailable)?;
            chunk.embedding = embedding;
        }

        Ok(chunks)
    }

    /// Record first, then the chunk set, under the document's lock.
    async fn persist(&self, document: Document, chunks: &[Chunk]) -> Result<(), IngestError> {
        let _guard = self.locks.acquire(&document.document_id).await;

        let persisting = document.with_status(IngestionStatus::Persisting);
        self.write_with_retry("record upsert", || self.records.upsert_document(&persisting))
            .await?;

        let replaced = self
            .write_with_retry("chunk replace", || {
                self.vectors.replace_chunks(&persisting.document_id, chunks)
            })
            .await;
        if let Err(error) = replaced {
            let failed = persisting.with_status(IngestionStatus::Failed);
            if let Err(mark_error) = self
                .write_with_retry("record upsert", || self.records.upsert_document(&failed))
                .await
            {
                warn!(document_id = %failed.document_id, error = %mark_error, "could not mark record failed");
            }
            return Err(error.into());
        }

        let ingested = persisting.with_status(IngestionStatus::Ingested);
        self.write_with_retry("record upsert", || self.records.upsert_document(&ingested))
            .await?;
        Ok(())
    }

    /// Removes every document under the directory `folder` from both stores
    /// and returns how many were removed. Records go first so the documents
    /// stop matching lexical queries before their chunks disappear.
    pub async fn forget_prefix(&self, folder: &Path) -> Result<usize, IngestError> {
        let prefix = directory_prefix(folder);
        let removed = self
            .write_with_retry("record prefix delete", || self.records.delete_by_prefix(&prefix))
            .await?;

        for document_id in &removed {
            let _guard = self.locks.acquire(document_id).await;
            self.write_with_retry("chunk delete", || self.vectors.replace_chunks(document_id, &[]))
                .await?;
        }

        self.ledger
            .write()
            .await
            .retain(|path, _| !path.starts_with(folder));

        info!(prefix = %prefix, removed = removed.len(), "documents forgotten");
        Ok(removed.len())
    }

    pub async fn clear(&self) -> Result<(), IngestError> {
        self.write_with_retry("record clear", || self.records.clear()).await?;
        self.write_with_retry("vector clear", || self.vectors.clear()).await?;
        self.ledger.write().await.clear();
        info!("both stores cleared");
        Ok(())
    }

    /// Keeps `path` out of subsequent scans. Returns false if it already was.
    pub async fn exclude(&self, path: &Path) -> bool {
        self.excluded.write().await.insert(path.to_path_buf())
    }

    pub async fn include(&self, path: &Path) -> bool {
        self.excluded.write().await.remove(path)
    }

    pub async fn status(&self, path: &Path) -> Option<FileState> {
        self.ledger.read().await.get(path).cloned()
    }

    pub async fn states(&self) -> Vec<FileState> {
        let mut states: Vec<FileState> = self.ledger.read().await.values().cloned().collect();
        states.sort_by(|left, right| left.path.cmp(&right.path));
        states
    }

    async fn transition(&self, state: &mut FileState, status: IngestionStatus) {
        state.status = status;
        state.updated_at = Utc::now();
        info!(path = %state.path.display(), document_id = %state.document_id, status = %status, "file state");
        self.record_state(state).await;
    }

    async fn fail(&self, state: &mut FileState, stage: IngestionStatus, error: &IngestError) {
        state.status = IngestionStatus::Failed;
        state.failed_stage = Some(stage);
        state.error = Some(error.to_string());
        state.updated_at = Utc::now();
        warn!(
            path = %state.path.display(),
            document_id = %state.document_id,
            stage = %stage,
            error = %error,
            "file failed"
        );
        self.record_state(state).await;
    }

    async fn record_state(&self, state: &FileState) {
        self.ledger
            .write()
            .await
            .insert(state.path.clone(), state.clone());
    }

    async fn write_with_retry<T, F, Fut>(&self, label: &'static str, operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        with_retry(
            label,
            self.config.model.retry.transient_retries,
            self.config.ingestion.store_timeout,
            operation,
            |timeout| StoreError::write("store", format!("{label} timed out after {timeout:?}")),
            |_| true,
        )
        .await
    }

    async fn read_with_retry<T, F, Fut>(&self, label: &'static str, operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        read_store_with_retry(
            label,
            self.config.model.retry.transient_retries,
            self.config.ingestion.store_timeout,
            operation,
        )
        .await
    }
}

/// `folder` as a string ending in the path separator, so a sibling such as
/// `old2/` never matches `old/`.
fn directory_prefix(folder: &Path) -> String {
    let mut prefix = folder.to_string_lossy().into_owned();
    if !prefix.ends_with(std::path::MAIN_SEPARATOR) {
        prefix.push(std::path::MAIN_SEPARATOR);
    }
    prefix
}

async fn collect_next(
    tasks: &mut JoinSet<(FileState, Disposition)>,
    outcomes: &mut Vec<(FileState, Disposition)>,
) {
    match tasks.join_next().await {
        Some(Ok(outcome)) => outcomes.push(outcome),
        Some(Err(error)) => warn!(error = %error, "ingestion worker aborted"),
        None => {}
    }
}
