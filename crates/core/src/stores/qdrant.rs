use crate::error::StoreError;
use crate::models::{rank_by_similarity, Chunk, ChunkMetadata, QueryFilters, ScoredChunk};
use crate::traits::VectorStore;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const BACKEND: &str = "qdrant";
const SCROLL_LIMIT: usize = 10_000;

/// Vector store backed by a Qdrant collection.
///
/// Qdrant has no multi-operation transaction, so each replacement writes its
/// points under a fresh `generation` and then deletes every older generation
/// of that document. Readers keep only the newest generation they see per
/// document: during the window between the two writes a query returns the
/// new set, never old and new together.
pub struct QdrantVectorStore {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
}

impl QdrantVectorStore {
    pub fn new(
        endpoint: impl Into<String>,
        collection: impl Into<String>,
        vector_size: usize,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| StoreError::write(BACKEND, error))?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client,
            vector_size,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.endpoint, self.collection)
    }

    pub async fn ensure_collection(&self) -> Result<(), StoreError> {
        let response = self
            .client
            .get(self.collection_url())
            .send()
            .await
            .map_err(|error| StoreError::write(BACKEND, error))?;

        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(StoreError::write(BACKEND, response.status()));
        }

        let response = self
            .client
            .put(self.collection_url())
            .json(&json!({
                "vectors": { "size": self.vector_size, "distance": "Cosine" }
            }))
            .send()
            .await
            .map_err(|error| StoreError::write(BACKEND, error))?;

        if !response.status().is_success() {
            return Err(StoreError::write(
                BACKEND,
                format!("collection setup failed with {}", response.status()),
            ));
        }

        for (field, schema) in [
            ("document_id", "keyword"),
            ("generation", "integer"),
            ("path_ancestors", "keyword"),
        ] {
            self.post_write(
                &format!("{}/index?wait=true", self.collection_url()),
                json!({ "field_name": field, "field_schema": schema }),
                "PUT",
            )
            .await?;
        }

        Ok(())
    }

    async fn post_write(&self, url: &str, body: Value, method: &str) -> Result<(), StoreError> {
        let request = match method {
            "PUT" => self.client.put(url),
            _ => self.client.post(url),
        };
        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|error| StoreError::write(BACKEND, error))?;

        if !response.status().is_success() {
            return Err(StoreError::write(BACKEND, response.status()));
        }
        Ok(())
    }

    async fn post_query(&self, url: &str, body: Value) -> Result<Value, StoreError> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|error| StoreError::query(BACKEND, error))?;

        if !response.status().is_success() {
            return Err(StoreError::query(BACKEND, response.status()));
        }

        response
            .json()
            .await
            .map_err(|error| StoreError::query(BACKEND, error))
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<(), StoreError> {
        let generation = Utc::now().timestamp_micros();

        let points = chunks
            .iter()
            .map(|chunk| {
                if chunk.document_id != document_id {
                    return Err(StoreError::write(
                        BACKEND,
                        format!("chunk {} belongs to {}", chunk.chunk_id, chunk.document_id),
                    ));
                }
                if chunk.embedding.len() != self.vector_size {
                    return Err(StoreError::write(
                        BACKEND,
                        format!(
                            "embedding dimension {} != {}",
                            chunk.embedding.len(),
                            self.vector_size
                        ),
                    ));
                }

                Ok(json!({
                    "id": point_id(document_id, generation, chunk.ordinal),
                    "vector": chunk.embedding,
                    "payload": chunk_payload(chunk, generation),
                }))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        if !points.is_empty() {
            self.post_write(
                &format!("{}/points?wait=true", self.collection_url()),
                json!({ "points": points }),
                "PUT",
            )
            .await?;
        }

        self.post_write(
            &format!("{}/points/delete?wait=true", self.collection_url()),
            json!({
                "filter": {
                    "must": [{ "key": "document_id", "match": { "value": document_id } }],
                    "must_not": [{ "key": "generation", "match": { "value": generation } }]
                }
            }),
            "POST",
        )
        .await?;

        debug!(document_id, generation, count = chunks.len(), "chunk generation written");
        Ok(())
    }

    async fn query_nearest(
        &self,
        embedding: &[f32],
        k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if embedding.len() != self.vector_size {
            return Err(StoreError::query(
                BACKEND,
                format!("query vector dim {} is not {}", embedding.len(), self.vector_size),
            ));
        }

        let mut body = json!({
            "vector": embedding,
            "limit": k.saturating_mul(2).max(1),
            "with_payload": true,
        });
        if let Some(filter) = build_filter(filters) {
            body["filter"] = filter;
        }

        let parsed = self
            .post_query(&format!("{}/points/search", self.collection_url()), body)
            .await?;

        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .map(|points| points.iter().filter_map(point_to_chunk).collect::<Vec<_>>())
            .unwrap_or_default();

        let mut hits: Vec<ScoredChunk> = keep_newest_generation(hits)
            .into_iter()
            .filter(|hit| filters.matches_chunk(&hit.chunk))
            .collect();
        rank_by_similarity(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let parsed = self
            .post_query(
                &format!("{}/points/scroll", self.collection_url()),
                json!({
                    "filter": {
                        "must": [{ "key": "document_id", "match": { "value": document_id } }]
                    },
                    "limit": SCROLL_LIMIT,
                    "with_payload": true,
                    "with_vector": true,
                }),
            )
            .await?;

        let points = parsed
            .pointer("/result/points")
            .and_then(Value::as_array)
            .map(|points| points.iter().filter_map(point_to_chunk).collect::<Vec<_>>())
            .unwrap_or_default();

        let mut chunks: Vec<Chunk> = keep_newest_generation(points)
            .into_iter()
            .map(|hit| hit.chunk)
            .collect();
        chunks.sort_by_key(|chunk| chunk.ordinal);
        Ok(chunks)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let response = self
            .client
            .delete(self.collection_url())
            .send()
            .await
            .map_err(|error| StoreError::write(BACKEND, error))?;

        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(StoreError::write(BACKEND, response.status()));
        }
        self.ensure_collection().await
    }
}

fn point_id(document_id: &str, generation: i64, ordinal: u32) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{document_id}:{generation}:{ordinal}").as_bytes(),
    )
    .to_string()
}

fn date_days(date: Option<NaiveDate>) -> Option<i32> {
    date.map(|date| date.num_days_from_ce())
}

fn chunk_payload(chunk: &Chunk, generation: i64) -> Value {
    json!({
        "document_id": chunk.document_id,
        "chunk_id": chunk.chunk_id,
        "ordinal": chunk.ordinal,
        "generation": generation,
        "start": chunk.start,
        "end": chunk.end,
        "text": chunk.text,
        "title": chunk.metadata.title,
        "source_path": chunk.metadata.source_path,
        "path_ancestors": path_ancestors(&chunk.metadata.source_path),
        "document_set": chunk.metadata.document_set,
        "date": chunk.metadata.date,
        "date_days": date_days(chunk.metadata.date),
        "entities": chunk.metadata.entities,
        "categories": chunk.metadata.categories,
    })
}

/// The path itself and every directory above it, so a keyword match on
/// `path_ancestors` answers a path-prefix filter.
fn path_ancestors(source_path: &str) -> Vec<String> {
    Path::new(source_path)
        .ancestors()
        .map(|ancestor| ancestor.to_string_lossy().into_owned())
        .filter(|ancestor| !ancestor.is_empty())
        .collect()
}

/// `prefix` in the form `path_ancestors` stores it: components rejoined,
/// trailing separators dropped.
fn ancestor_key(prefix: &str) -> String {
    Path::new(prefix)
        .components()
        .collect::<PathBuf>()
        .to_string_lossy()
        .into_owned()
}

fn build_filter(filters: &QueryFilters) -> Option<Value> {
    let mut must = Vec::new();

    if let Some(id) = &filters.document_id {
        must.push(json!({"key": "document_id", "match": {"value": id}}));
    }
    if let Some(set) = &filters.document_set {
        must.push(json!({"key": "document_set", "match": {"value": set}}));
    }
    if let Some(category) = &filters.category {
        must.push(json!({"key": "categories", "match": {"value": category}}));
    }
    if let Some(entity) = &filters.entity {
        must.push(json!({"key": "entities", "match": {"value": entity}}));
    }
    if let Some(prefix) = &filters.path_prefix {
        must.push(json!({"key": "path_ancestors", "match": {"value": ancestor_key(prefix)}}));
    }
    if filters.date_from.is_some() || filters.date_to.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(from) = date_days(filters.date_from) {
            range.insert("gte".to_string(), json!(from));
        }
        if let Some(to) = date_days(filters.date_to) {
            range.insert("lte".to_string(), json!(to));
        }
        must.push(json!({"key": "date_days", "range": range}));
    }

    (!must.is_empty()).then(|| json!({ "must": must }))
}

struct GenerationHit {
    generation: i64,
    hit: ScoredChunk,
}

fn point_to_chunk(point: &Value) -> Option<GenerationHit> {
    let payload = point.get("payload")?;
    let text_field = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let string_list = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };

    let embedding = point
        .get("vector")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_f64)
                .map(|value| value as f32)
                .collect()
        })
        .unwrap_or_default();

    let chunk = Chunk {
        chunk_id: text_field("chunk_id"),
        document_id: text_field("document_id"),
        ordinal: u32::try_from(payload.get("ordinal")?.as_u64()?).ok()?,
        start: payload.get("start").and_then(Value::as_u64).unwrap_or_default() as usize,
        end: payload.get("end").and_then(Value::as_u64).unwrap_or_default() as usize,
        text: text_field("text"),
        embedding,
        metadata: ChunkMetadata {
            title: text_field("title"),
            source_path: text_field("source_path"),
            document_set: text_field("document_set"),
            date: payload
                .get("date")
                .and_then(Value::as_str)
                .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()),
            entities: string_list("entities"),
            categories: string_list("categories"),
        },
    };

    Some(GenerationHit {
        generation: payload.get("generation")?.as_i64()?,
        hit: ScoredChunk {
            chunk,
            score: point.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32,
        },
    })
}

/// Drops every point whose document also appears under a newer generation.
fn keep_newest_generation(points: Vec<GenerationHit>) -> Vec<ScoredChunk> {
    let mut newest: HashMap<String, i64> = HashMap::new();
    for point in &points {
        newest
            .entry(point.hit.chunk.document_id.clone())
            .and_modify(|generation| *generation = (*generation).max(point.generation))
            .or_insert(point.generation);
    }

    points
        .into_iter()
        .filter(|point| newest.get(&point.hit.chunk.document_id) == Some(&point.generation))
        .map(|point| point.hit)
        .collect()
}
