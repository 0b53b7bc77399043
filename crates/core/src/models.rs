use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Value stored for any metadata field the model could not determine.
pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Discovered,
    Extracting,
    Chunking,
    Persisting,
    Ingested,
    Failed,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Discovered => "discovered",
            IngestionStatus::Extracting => "extracting",
            IngestionStatus::Chunking => "chunking",
            IngestionStatus::Persisting => "persisting",
            IngestionStatus::Ingested => "ingested",
            IngestionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated language-model output for one document, before it is merged
/// into a [`Document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub title: String,
    pub document_set: String,
    pub date: Option<NaiveDate>,
    pub entities: Vec<String>,
    pub categories: Vec<String>,
    pub summary: String,
}

/// One ingested source file as held by the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub source_path: String,
    pub file_name: String,
    pub file_type: String,
    pub title: String,
    pub document_set: String,
    pub date: Option<NaiveDate>,
    pub entities: Vec<String>,
    pub categories: Vec<String>,
    pub summary: String,
    pub text: String,
    pub technical_metadata: BTreeMap<String, String>,
    pub status: IngestionStatus,
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

impl Document {
    pub fn chunk_metadata(&self) -> ChunkMetadata {
        ChunkMetadata {
            title: self.title.clone(),
            source_path: self.source_path.clone(),
            document_set: self.document_set.clone(),
            date: self.date,
            entities: self.entities.clone(),
            categories: self.categories.clone(),
        }
    }

    pub fn with_status(mut self, status: IngestionStatus) -> Self {
        self.status = status;
        self
    }

    /// Number of distinct keywords found in title, summary, entities or
    /// categories (case-insensitive substring match).
    pub fn keyword_score(&self, keywords: &[String]) -> usize {
        let title = self.title.to_lowercase();
        let summary = self.summary.to_lowercase();
        let entities = self.entities.join("\n").to_lowercase();
        let categories = self.categories.join("\n").to_lowercase();

        keywords
            .iter()
            .map(|keyword| keyword.to_lowercase())
            .filter(|keyword| {
                title.contains(keyword)
                    || summary.contains(keyword)
                    || entities.contains(keyword)
                    || categories.contains(keyword)
            })
            .count()
    }
}

/// Subset of document metadata copied onto every chunk so vector queries can
/// filter without a record-store lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChunkMetadata {
    pub title: String,
    pub source_path: String,
    pub document_set: String,
    pub date: Option<NaiveDate>,
    pub entities: Vec<String>,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: u32,
    /// Character offsets of the span within the document text.
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Descending similarity; equal scores fall back to document id then ordinal.
pub fn rank_by_similarity(hits: &mut [ScoredChunk]) {
    hits.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.chunk.document_id.cmp(&right.chunk.document_id))
            .then_with(|| left.chunk.ordinal.cmp(&right.chunk.ordinal))
    });
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct QueryFilters {
    pub document_id: Option<String>,
    pub document_set: Option<String>,
    pub category: Option<String>,
    pub entity: Option<String>,
    /// Directory or file the source path lies under, compared by whole path
    /// components.
    pub path_prefix: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub status: Option<IngestionStatus>,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        *self == QueryFilters::default()
    }

    pub fn for_document(&self, document_id: &str) -> Self {
        Self {
            document_id: Some(document_id.to_string()),
            ..self.clone()
        }
    }

    pub fn matches_document(&self, document: &Document) -> bool {
        if let Some(status) = self.status {
            if document.status != status {
                return false;
            }
        }
        self.matches_fields(
            &document.document_id,
            &document.source_path,
            &document.document_set,
            document.date,
            &document.entities,
            &document.categories,
        )
    }

    /// `status` is a record-level attribute and is ignored for chunks.
    pub fn matches_chunk(&self, chunk: &Chunk) -> bool {
        self.matches_fields(
            &chunk.document_id,
            &chunk.metadata.source_path,
            &chunk.metadata.document_set,
            chunk.metadata.date,
            &chunk.metadata.entities,
            &chunk.metadata.categories,
        )
    }

    fn matches_fields(
        &self,
        document_id: &str,
        source_path: &str,
        document_set: &str,
        date: Option<NaiveDate>,
        entities: &[String],
        categories: &[String],
    ) -> bool {
        if let Some(expected) = &self.document_id {
            if document_id != expected {
                return false;
            }
        }
        if let Some(expected) = &self.document_set {
            if document_set != expected {
                return false;
            }
        }
        if let Some(expected) = &self.category {
            if !categories.iter().any(|category| category == expected) {
                return false;
            }
        }
        if let Some(expected) = &self.entity {
            if !entities.iter().any(|entity| entity == expected) {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !Path::new(source_path).starts_with(prefix) {
                return false;
            }
        }
        if self.date_from.is_some() || self.date_to.is_some() {
            let Some(date) = date else {
                return false;
            };
            if self.date_from.is_some_and(|from| date < from) {
                return false;
            }
            if self.date_to.is_some_and(|to| date > to) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LexicalQuery {
    pub keywords: Vec<String>,
    pub filters: QueryFilters,
    pub limit: usize,
}

const STOPWORDS: [&str; 24] = [
    "the", "and", "for", "are", "was", "were", "what", "when", "where", "which", "who", "whom",
    "why", "how", "did", "does", "about", "with", "from", "that", "this", "there", "have", "has",
];

impl LexicalQuery {
    /// Splits free text into lowercase keywords, dropping short tokens and
    /// stopwords. A query with no surviving token is kept whole.
    pub fn from_text(text: &str, filters: QueryFilters, limit: usize) -> Self {
        let mut keywords: Vec<String> = Vec::new();
        for token in text.split_whitespace() {
            let token = token
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if token.chars().count() > 2
                && !STOPWORDS.contains(&token.as_str())
                && !keywords.contains(&token)
            {
                keywords.push(token);
            }
        }

        if keywords.is_empty() && !text.trim().is_empty() {
            keywords.push(text.trim().to_lowercase());
        }

        Self {
            keywords,
            filters,
            limit,
        }
    }
}

/// Orders lexical matches: more keywords matched first, then document id.
pub fn rank_lexical(documents: &mut [(usize, Document)]) {
    documents.sort_by(|(left_score, left), (right_score, right)| {
        right_score
            .cmp(left_score)
            .then_with(|| left.document_id.cmp(&right.document_id))
    });
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Lexical,
    Semantic,
    #[default]
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lexical" | "keyword" => Ok(SearchMode::Lexical),
            "semantic" | "vector" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!("unknown search mode `{other}`")),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SearchMode::Lexical => "lexical",
            SearchMode::Semantic => "semantic",
            SearchMode::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HitOrigin {
    Lexical,
    Semantic,
    Both,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HitUnit {
    Chunk { ordinal: u32 },
    Summary,
}

/// One retrieved unit: a chunk, or a document summary when a lexically
/// matched document has no chunk to offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedHit {
    pub document_id: String,
    pub title: String,
    pub source_path: String,
    pub unit: HitUnit,
    pub text: String,
    pub score: f64,
    pub origin: HitOrigin,
}

impl RankedHit {
    pub fn from_chunk(scored: &ScoredChunk, origin: HitOrigin) -> Self {
        Self {
            document_id: scored.chunk.document_id.clone(),
            title: scored.chunk.metadata.title.clone(),
            source_path: scored.chunk.metadata.source_path.clone(),
            unit: HitUnit::Chunk {
                ordinal: scored.chunk.ordinal,
            },
            text: scored.chunk.text.clone(),
            score: f64::from(scored.score),
            origin,
        }
    }

    pub fn from_summary(document: &Document) -> Self {
        Self {
            document_id: document.document_id.clone(),
            title: document.title.clone(),
            source_path: document.source_path.clone(),
            unit: HitUnit::Summary,
            text: document.summary.clone(),
            score: 0.0,
            origin: HitOrigin::Lexical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SearchOutput {
    Documents(Vec<Document>),
    Ranked(Vec<RankedHit>),
}

impl SearchOutput {
    pub fn len(&self) -> usize {
        match self {
            SearchOutput::Documents(documents) => documents.len(),
            SearchOutput::Ranked(hits) => hits.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// `None` when retrieval found nothing to ground an answer on.
    pub answer: Option<String>,
    pub citations: Vec<String>,
    pub hits: Vec<RankedHit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPage {
    pub documents: Vec<Document>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
}

impl DocumentPage {
    /// Slices an already ordered list; pages are 1-based.
    pub fn from_sorted(all: Vec<Document>, page: usize, per_page: usize) -> Self {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let total = all.len();
        let total_pages = total.div_ceil(per_page);
        let documents = all
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect();

        Self {
            documents,
            total,
            page,
            per_page,
            total_pages,
        }
    }
}

/// Newest ingestion first; ties by id so pages are stable.
pub fn newest_first(left: &Document, right: &Document) -> Ordering {
    right
        .ingested_at
        .cmp(&left.ingested_at)
        .then_with(|| left.document_id.cmp(&right.document_id))
}
