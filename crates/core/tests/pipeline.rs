use archivist_core::{
    document_id_for, CharacterNgramEmbedder, Chunk, ChunkMetadata, ChunkingConfig,
    IngestionCoordinator, IngestionStatus, LanguageModel, MemoryRecordStore, MemoryVectorStore,
    ModelError, PipelineConfig, Prompt, QueryEngine, QueryFilters, RecordStore, ScoredChunk,
    SearchMode, SearchOutput, StoreError, VectorStore,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

/// Answers extraction prompts from the file name and synthesis prompts by
/// citing the first passage plus one id that was never supplied.
#[derive(Default)]
struct ArchiveModel {
    extraction_calls: AtomicUsize,
    synthesis_calls: AtomicUsize,
}

const FABRICATED_ID: &str = "fabricated-id";

impl ArchiveModel {
    fn extractions(&self) -> usize {
        self.extraction_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ArchiveModel {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ModelError> {
        let first = prompt
            .messages
            .first()
            .map(|message| message.content.as_str())
            .unwrap_or_default();

        if prompt.schema_hint.is_none() {
            self.synthesis_calls.fetch_add(1, Ordering::SeqCst);
            let cited = first
                .split("[doc:")
                .nth(1)
                .and_then(|rest| rest.split(']').next())
                .unwrap_or("none");
            return Ok(format!(
                "The levy was approved [doc:{cited}]. Some say otherwise [doc:{FABRICATED_ID}]."
            ));
        }

        self.extraction_calls.fetch_add(1, Ordering::SeqCst);
        if first.contains("POISON") {
            return Ok("I would rather not produce JSON today.".to_string());
        }

        let file_name = first
            .lines()
            .find_map(|line| line.strip_prefix("File name: "))
            .unwrap_or("unknown");
        let (title, summary) = match file_name {
            "levy.txt" => ("Library levy hearing", "The library levy was heard. It passed."),
            _ => ("Routine minutes", "Routine business was handled. Nothing else happened."),
        };
        let entities = if first.contains("jane doe") {
            r#"["jane doe"]"#
        } else {
            "[]"
        };

        Ok(format!(
            r#"```json
{{"title": "{title}", "document_set": "council", "date": "2024-03-01",
"entities": {entities}, "categories": ["minutes"], "summary": "{summary}"}}
```"#
        ))
    }
}

/// Vector store whose writes can be switched to fail.
struct FlakyVectorStore {
    inner: MemoryVectorStore,
    failing: AtomicBool,
}

#[async_trait]
impl VectorStore for FlakyVectorStore {
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::write("flaky", "disk full"));
        }
        self.inner.replace_chunks(document_id, chunks).await
    }

    async fn query_nearest(
        &self,
        embedding: &[f32],
        k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        self.inner.query_nearest(embedding, k, filters).await
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError> {
        self.inner.chunks_for_document(document_id).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.inner.clear().await
    }
}

struct Harness {
    coordinator: Arc<IngestionCoordinator>,
    engine: QueryEngine,
    records: MemoryRecordStore,
    vectors: Arc<dyn VectorStore>,
    model: Arc<ArchiveModel>,
}

fn harness_with(config: PipelineConfig, vectors: Arc<dyn VectorStore>) -> Harness {
    let records = MemoryRecordStore::new();
    let model = Arc::new(ArchiveModel::default());
    let embedder = Arc::new(CharacterNgramEmbedder::default());

    let coordinator = IngestionCoordinator::new(
        Arc::new(records.clone()),
        Arc::clone(&vectors),
        model.clone(),
        embedder.clone(),
        config.clone(),
    )
    .expect("valid pipeline config");

    let engine = QueryEngine::new(
        Arc::new(records.clone()),
        Arc::clone(&vectors),
        embedder,
        model.clone(),
        &config,
    )
    .expect("valid query config");

    Harness {
        coordinator: Arc::new(coordinator),
        engine,
        records,
        vectors,
        model,
    }
}

fn harness(config: PipelineConfig) -> Harness {
    let dimensions = CharacterNgramEmbedder::default().dimensions;
    harness_with(config, Arc::new(MemoryVectorStore::new(dimensions)))
}

fn small_chunks() -> PipelineConfig {
    PipelineConfig {
        chunking: ChunkingConfig::new(40, 0.1),
        ..PipelineConfig::default()
    }
}

fn long_text(sentences: usize) -> String {
    (0..sentences)
        .map(|index| format!("Paragraph {index} covers the library levy vote."))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::test]
async fn unchanged_files_are_ingested_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("levy.txt");
    fs::write(&path, long_text(6)).unwrap();

    let h = harness(small_chunks());
    let first = h.coordinator.ingest_directory(dir.path()).await.unwrap();
    assert_eq!(first.ingested, 1);

    let id = document_id_for(&path);
    let record = h.records.get_document(&id).await.unwrap().unwrap();
    let chunks = h.vectors.chunks_for_document(&id).await.unwrap();
    assert!(chunks.len() > 1);

    let second = h.coordinator.ingest_directory(dir.path()).await.unwrap();
    assert_eq!(second.skipped, 1);
    assert_eq!(second.ingested, 0);
    assert_eq!(h.model.extractions(), 1);

    assert_eq!(h.records.get_document(&id).await.unwrap().unwrap(), record);
    assert_eq!(h.vectors.chunks_for_document(&id).await.unwrap(), chunks);
    assert_eq!(h.records.len().await, 1);
}

#[tokio::test]
async fn changed_content_replaces_every_chunk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("levy.txt");
    fs::write(&path, long_text(8)).unwrap();

    let h = harness(small_chunks());
    h.coordinator.ingest_directory(dir.path()).await.unwrap();
    let id = document_id_for(&path);
    let before = h.vectors.chunks_for_document(&id).await.unwrap();

    fs::write(&path, long_text(2)).unwrap();
    let report = h.coordinator.ingest_directory(dir.path()).await.unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(h.model.extractions(), 2);

    let after = h.vectors.chunks_for_document(&id).await.unwrap();
    assert!(after.len() < before.len());

    let ordinals: Vec<u32> = after.iter().map(|chunk| chunk.ordinal).collect();
    let expected: Vec<u32> = (0..after.len() as u32).collect();
    assert_eq!(ordinals, expected);

    let old_ids: HashSet<_> = before.iter().map(|chunk| chunk.chunk_id.as_str()).collect();
    assert!(after.iter().all(|chunk| !old_ids.contains(chunk.chunk_id.as_str())));

    let record = h.records.get_document(&id).await.unwrap().unwrap();
    assert_eq!(record.text, long_text(2));
}

#[tokio::test]
async fn one_bad_file_does_not_block_the_batch() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("1.txt"), "First set of minutes.").unwrap();
    fs::write(dir.path().join("2.txt"), "POISON minutes the model cannot describe.").unwrap();
    fs::write(dir.path().join("3.txt"), "Third set of minutes.").unwrap();

    let h = harness(PipelineConfig::default());
    let report = h.coordinator.ingest_directory(dir.path()).await.unwrap();

    assert_eq!(report.ingested, 2);
    assert_eq!(report.failed, 1);

    let statuses: Vec<_> = report
        .files
        .iter()
        .map(|state| (state.path.file_name().unwrap().to_str().unwrap(), state.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("1.txt", IngestionStatus::Ingested),
            ("2.txt", IngestionStatus::Failed),
            ("3.txt", IngestionStatus::Ingested),
        ]
    );

    let failed = &report.files[1];
    assert_eq!(failed.failed_stage, Some(IngestionStatus::Extracting));
    assert!(failed.error.as_deref().unwrap().contains("schema"));
    assert!(h
        .records
        .get_document(&document_id_for(&failed.path))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn failed_vector_write_keeps_record_and_recovers_on_retry() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("levy.txt");
    fs::write(&path, "The library levy was put to a vote.").unwrap();

    let dimensions = CharacterNgramEmbedder::default().dimensions;
    let flaky = Arc::new(FlakyVectorStore {
        inner: MemoryVectorStore::new(dimensions),
        failing: AtomicBool::new(true),
    });
    let h = harness_with(PipelineConfig::default(), flaky.clone());

    let report = h.coordinator.ingest_directory(dir.path()).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.files[0].failed_stage, Some(IngestionStatus::Persisting));

    let id = document_id_for(&path);
    let record = h.records.get_document(&id).await.unwrap().unwrap();
    assert_eq!(record.status, IngestionStatus::Failed);
    assert_eq!(record.title, "Library levy hearing");
    assert!(h.vectors.chunks_for_document(&id).await.unwrap().is_empty());

    flaky.failing.store(false, Ordering::SeqCst);
    let retry = h.coordinator.ingest_directory(dir.path()).await.unwrap();
    assert_eq!(retry.ingested, 1);
    assert_eq!(h.model.extractions(), 1);

    let recovered = h.records.get_document(&id).await.unwrap().unwrap();
    assert_eq!(recovered.status, IngestionStatus::Ingested);
    assert_eq!(recovered.title, record.title);
    assert_eq!(recovered.summary, record.summary);
    assert_eq!(h.vectors.chunks_for_document(&id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn excluded_failures_wait_until_included() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.txt");
    fs::write(&path, "POISON").unwrap();

    let h = harness(PipelineConfig::default());
    let first = h.coordinator.ingest_directory(dir.path()).await.unwrap();
    assert_eq!(first.failed, 1);
    let calls = h.model.extractions();

    assert!(h.coordinator.exclude(&path).await);
    let excluded = h.coordinator.ingest_directory(dir.path()).await.unwrap();
    assert_eq!(excluded.excluded, 1);
    assert_eq!(excluded.files[0].status, IngestionStatus::Failed);
    assert_eq!(h.model.extractions(), calls);

    assert!(h.coordinator.include(&path).await);
    let retried = h.coordinator.ingest_directory(dir.path()).await.unwrap();
    assert_eq!(retried.failed, 1);
    assert!(h.model.extractions() > calls);
}

#[tokio::test]
async fn known_names_correct_extracted_entities() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("names.txt"), "Jane Doe\n").unwrap();
    let path = dir.path().join("minutes.txt");
    fs::write(&path, "Motion by jane doe to adjourn.").unwrap();

    let h = harness(PipelineConfig::default());
    let report = h.coordinator.ingest_directory(dir.path()).await.unwrap();
    assert_eq!(report.files.len(), 1);

    let record = h
        .records
        .get_document(&document_id_for(&path))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.entities, vec!["Jane Doe"]);
}

#[tokio::test]
async fn hybrid_ranks_lexical_match_no_lower_than_semantic() {
    let dir = tempdir().unwrap();
    let lexical_path = dir.path().join("levy.txt");
    let semantic_path = dir.path().join("minutes.txt");
    fs::write(&lexical_path, "The board met on Tuesday. Attendance was taken.").unwrap();
    fs::write(&semantic_path, "levy vote levy vote levy vote on the levy").unwrap();

    let h = harness(PipelineConfig::default());
    h.coordinator.ingest_directory(dir.path()).await.unwrap();

    let lexical_id = document_id_for(&lexical_path);
    let semantic_id = document_id_for(&semantic_path);
    let filters = QueryFilters::default();

    let SearchOutput::Ranked(semantic) = h
        .engine
        .search("levy vote", SearchMode::Semantic, &filters)
        .await
        .unwrap()
    else {
        panic!("semantic search returns ranked hits");
    };
    let SearchOutput::Ranked(hybrid) = h
        .engine
        .search("levy vote", SearchMode::Hybrid, &filters)
        .await
        .unwrap()
    else {
        panic!("hybrid search returns ranked hits");
    };

    let position = |hits: &[archivist_core::RankedHit], id: &str| {
        hits.iter().position(|hit| hit.document_id == id)
    };
    assert!(position(&hybrid[..], &semantic_id).is_some());
    let hybrid_rank = position(&hybrid[..], &lexical_id).expect("lexical match present");
    let semantic_rank = position(&semantic[..], &lexical_id).unwrap_or(usize::MAX);
    assert!(hybrid_rank <= semantic_rank);
    assert_eq!(hybrid_rank, 0);

    let SearchOutput::Documents(documents) = h
        .engine
        .search("levy", SearchMode::Lexical, &filters)
        .await
        .unwrap()
    else {
        panic!("lexical search returns documents");
    };
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].document_id, lexical_id);
}

#[tokio::test]
async fn answers_only_cite_supplied_documents() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("levy.txt"), "The library levy passed five to two.").unwrap();
    fs::write(dir.path().join("other.txt"), "Parking permits were discussed.").unwrap();

    let h = harness(PipelineConfig::default());
    h.coordinator.ingest_directory(dir.path()).await.unwrap();

    let answer = h
        .engine
        .ask("Did the library levy pass?", &QueryFilters::default())
        .await
        .unwrap();

    let supplied: HashSet<&str> = answer
        .hits
        .iter()
        .take(PipelineConfig::default().retrieval.context_k)
        .map(|hit| hit.document_id.as_str())
        .collect();
    assert!(!answer.citations.is_empty());
    assert!(answer
        .citations
        .iter()
        .all(|id| supplied.contains(id.as_str())));
    assert!(!answer.citations.iter().any(|id| id == FABRICATED_ID));
    assert!(!answer.answer.unwrap().contains(FABRICATED_ID));
}

#[tokio::test]
async fn asking_an_empty_archive_makes_no_model_call() {
    let h = harness(PipelineConfig::default());
    let answer = h
        .engine
        .ask("anything at all", &QueryFilters::default())
        .await
        .unwrap();

    assert!(answer.answer.is_none());
    assert!(answer.hits.is_empty());
    assert_eq!(h.model.synthesis_calls.load(Ordering::SeqCst), 0);
}

fn generation(label: &str, count: u32) -> Vec<Chunk> {
    (0..count)
        .map(|ordinal| Chunk {
            chunk_id: format!("{label}-{ordinal}"),
            document_id: "doc".to_string(),
            ordinal,
            start: 0,
            end: 0,
            text: label.to_string(),
            embedding: vec![1.0, ordinal as f32 * 0.01],
            metadata: ChunkMetadata::default(),
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_queries_never_see_mixed_chunk_sets() {
    let store = Arc::new(MemoryVectorStore::new(2));
    store.replace_chunks("doc", &generation("old", 5)).await.unwrap();

    let writer = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            for round in 0..300 {
                let next = if round % 2 == 0 {
                    generation("new", 2)
                } else {
                    generation("old", 5)
                };
                store.replace_chunks("doc", &next).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let reader = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let filters = QueryFilters::default().for_document("doc");
            for _ in 0..300 {
                let hits = store.query_nearest(&[1.0, 0.0], 10, &filters).await.unwrap();
                let labels: HashSet<&str> = hits.iter().map(|hit| hit.chunk.text.as_str()).collect();
                assert!(labels.len() <= 1, "mixed chunk sets observed: {labels:?}");
                if let Some(label) = labels.iter().next() {
                    let expected = if *label == "old" { 5 } else { 2 };
                    assert_eq!(hits.len(), expected);
                }
                tokio::task::yield_now().await;
            }
        })
    };

    writer.await.unwrap();
    reader.await.unwrap();
}

#[tokio::test]
async fn forgetting_a_folder_hides_it_from_search() {
    let dir = tempdir().unwrap();
    let archived = dir.path().join("archived");
    fs::create_dir(&archived).unwrap();
    fs::write(archived.join("levy.txt"), "The library levy passed.").unwrap();

    let h = harness(PipelineConfig::default());
    h.coordinator.ingest_directory(dir.path()).await.unwrap();
    assert_eq!(h.coordinator.forget_prefix(Path::new(&archived)).await.unwrap(), 1);

    let output = h
        .engine
        .search("library levy", SearchMode::Hybrid, &QueryFilters::default())
        .await
        .unwrap();
    assert!(output.is_empty());
    assert_eq!(h.engine.browse(1, 10).await.unwrap().total, 0);
}
