use crate::error::StoreError;
use crate::models::{Document, DocumentPage, LexicalQuery, QueryFilters};
use crate::traits::RecordStore;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const BACKEND: &str = "opensearch";
const PREFIX_DELETE_PAGE: usize = 1_000;

/// Record store backed by one OpenSearch index, one `_doc` per document.
pub struct OpenSearchRecordStore {
    client: Arc<Client>,
    endpoint: String,
    index_name: String,
}

impl OpenSearchRecordStore {
    pub fn new(
        endpoint: impl Into<String>,
        index_name: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| StoreError::write(BACKEND, error))?;

        Ok(Self {
            client: Arc::new(client),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            index_name: index_name.into(),
        })
    }

    pub async fn ensure_index(&self) -> Result<(), StoreError> {
        let response = self
            .client
            .head(format!("{}/{}", self.endpoint, self.index_name))
            .send()
            .await
            .map_err(|error| StoreError::write(BACKEND, error))?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }

        if !response.status().is_client_error() {
            return Err(StoreError::write(BACKEND, response.status()));
        }

        let text_with_raw = json!({
            "type": "text",
            "fields": { "raw": { "type": "keyword" } }
        });

        let response = self
            .client
            .put(format!("{}/{}", self.endpoint, self.index_name))
            .json(&json!({
                "settings": {
                    "number_of_shards": 1,
                    "number_of_replicas": 0
                },
                "mappings": {
                    "properties": {
                        "document_id": {"type": "keyword"},
                        "source_path": {"type": "keyword"},
                        "file_name": {"type": "keyword"},
                        "file_type": {"type": "keyword"},
                        "title": {"type": "text"},
                        "summary": {"type": "text"},
                        "text": {"type": "text", "index": false},
                        "document_set": {"type": "keyword"},
                        "date": {"type": "date", "format": "yyyy-MM-dd"},
                        "entities": text_with_raw,
                        "categories": text_with_raw,
                        "status": {"type": "keyword"},
                        "content_hash": {"type": "keyword"},
                        "technical_metadata": {"type": "object", "enabled": false},
                        "last_modified": {"type": "date"},
                        "ingested_at": {"type": "date"}
                    }
                }
            }))
            .send()
            .await
            .map_err(|error| StoreError::write(BACKEND, error))?;

        if !response.status().is_success() {
            return Err(StoreError::write(
                BACKEND,
                format!("index setup failed with {}", response.status()),
            ));
        }

        Ok(())
    }

    async fn search(&self, body: &Value) -> Result<Value, StoreError> {
        let response = self
            .client
            .post(format!("{}/{}/_search", self.endpoint, self.index_name))
            .json(body)
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

    async fn delete_by_query(&self, query: Value) -> Result<(), StoreError> {
        let response = self
            .client
            .post(format!(
                "{}/{}/_delete_by_query?refresh=true&conflicts=proceed",
                self.endpoint, self.index_name
            ))
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(|error| StoreError::write(BACKEND, error))?;

        if !response.status().is_success() {
            return Err(StoreError::write(BACKEND, response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for OpenSearchRecordStore {
    async fn upsert_document(&self, document: &Document) -> Result<(), StoreError> {
        let response = self
            .client
            .put(format!(
                "{}/{}/_doc/{}?refresh=wait_for",
                self.endpoint, self.index_name, document.document_id
            ))
            .json(document)
            .send()
            .await
            .map_err(|error| StoreError::write(BACKEND, error))?;

        if !response.status().is_success() {
            return Err(StoreError::write(BACKEND, response.status()));
        }

        debug!(document_id = %document.document_id, "record indexed");
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, StoreError> {
        let response = self
            .client
            .get(format!(
                "{}/{}/_doc/{}",
                self.endpoint, self.index_name, document_id
            ))
            .send()
            .await
            .map_err(|error| StoreError::query(BACKEND, error))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StoreError::query(BACKEND, response.status()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| StoreError::query(BACKEND, error))?;
        match body.get("_source") {
            Some(source) => serde_json::from_value(source.clone())
                .map(Some)
                .map_err(|error| StoreError::query(BACKEND, error)),
            None => Ok(None),
        }
    }

    async fn query_lexical(&self, query: &LexicalQuery) -> Result<Vec<Document>, StoreError> {
        let response = self.search(&lexical_body(query)).await?;
        parse_hits(&response)
    }

    async fn list_documents(&self, page: usize, per_page: usize) -> Result<DocumentPage, StoreError> {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let response = self
            .search(&json!({
                "from": (page - 1) * per_page,
                "size": per_page,
                "track_total_hits": true,
                "query": { "match_all": {} },
                "sort": [{ "ingested_at": "desc" }, { "document_id": "asc" }]
            }))
            .await?;

        let total = response
            .pointer("/hits/total/value")
            .and_then(Value::as_u64)
            .unwrap_or_default() as usize;

        Ok(DocumentPage {
            documents: parse_hits(&response)?,
            total,
            page,
            per_page,
            total_pages: total.div_ceil(per_page),
        })
    }

    async fn delete_by_prefix(&self, path_prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut removed = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let response = self
                .search(&prefix_page_body(path_prefix, after.as_deref()))
                .await?;
            let page = hit_ids(&response);
            if page.is_empty() {
                break;
            }

            self.delete_by_query(json!({ "ids": { "values": page } }))
                .await?;
            after = page.last().cloned();
            let full = page.len() == PREFIX_DELETE_PAGE;
            removed.extend(page);
            if !full {
                break;
            }
        }

        Ok(removed)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.delete_by_query(json!({ "match_all": {} })).await
    }
}

fn lexical_body(query: &LexicalQuery) -> Value {
    let keyword_clauses: Vec<Value> = query
        .keywords
        .iter()
        .map(|keyword| {
            json!({
                "multi_match": {
                    "query": keyword,
                    "fields": ["title^2", "summary", "entities", "categories"]
                }
            })
        })
        .collect();

    let bool_query = if keyword_clauses.is_empty() {
        json!({ "filter": build_filters(&query.filters) })
    } else {
        json!({
            "should": keyword_clauses,
            "minimum_should_match": 1,
            "filter": build_filters(&query.filters)
        })
    };

    json!({
        "size": query.limit,
        "query": { "bool": bool_query },
        "sort": ["_score", { "document_id": "asc" }]
    })
}

fn build_filters(filters: &QueryFilters) -> Vec<Value> {
    let mut predicates = Vec::new();

    if let Some(id) = &filters.document_id {
        predicates.push(json!({"term": {"document_id": id}}));
    }
    if let Some(set) = &filters.document_set {
        predicates.push(json!({"term": {"document_set": set}}));
    }
    if let Some(category) = &filters.category {
        predicates.push(json!({"term": {"categories.raw": category}}));
    }
    if let Some(entity) = &filters.entity {
        predicates.push(json!({"term": {"entities.raw": entity}}));
    }
    if let Some(prefix) = &filters.path_prefix {
        let exact = prefix.trim_end_matches(['/', '\\']);
        let exact = if exact.is_empty() { prefix.as_str() } else { exact };
        predicates.push(json!({"bool": {
            "should": [
                {"term": {"source_path": exact}},
                {"prefix": {"source_path": directory_prefix(exact)}}
            ],
            "minimum_should_match": 1
        }}));
    }
    if let Some(status) = filters.status {
        predicates.push(json!({"term": {"status": status.as_str()}}));
    }
    if filters.date_from.is_some() || filters.date_to.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(from) = filters.date_from {
            range.insert("gte".to_string(), json!(from.to_string()));
        }
        if let Some(to) = filters.date_to {
            range.insert("lte".to_string(), json!(to.to_string()));
        }
        predicates.push(json!({"range": {"date": range}}));
    }

    predicates
}

fn directory_prefix(path: &str) -> String {
    if path.ends_with(['/', '\\']) {
        path.to_string()
    } else {
        format!("{path}{}", std::path::MAIN_SEPARATOR)
    }
}

/// One page of ids under `path_prefix`, resumed after the last deleted id.
fn prefix_page_body(path_prefix: &str, after: Option<&str>) -> Value {
    let mut body = json!({
        "size": PREFIX_DELETE_PAGE,
        "_source": false,
        "query": { "prefix": { "source_path": path_prefix } },
        "sort": [{ "document_id": "asc" }]
    });
    if let Some(after) = after {
        body["search_after"] = json!([after]);
    }
    body
}

fn hit_ids(response: &Value) -> Vec<String> {
    response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| hit.get("_id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_hits(response: &Value) -> Result<Vec<Document>, StoreError> {
    response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| hit.get("_source"))
                .map(|source| {
                    serde_json::from_value(source.clone())
                        .map_err(|error| StoreError::query(BACKEND, error))
                })
                .collect()
        })
        .unwrap_or_else(|| Ok(Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IngestionStatus;
    use chrono::NaiveDate;

    #[test]
    fn filters_become_term_prefix_and_range_predicates() {
        let filters = QueryFilters {
            document_set: Some("council".to_string()),
            category: Some("parks".to_string()),
            path_prefix: Some("/archive".to_string()),
            date_from: NaiveDate::from_ymd_opt(2023, 1, 1),
            status: Some(IngestionStatus::Ingested),
            ..QueryFilters::default()
        };

        let predicates = build_filters(&filters);
        assert_eq!(predicates.len(), 5);
        assert!(predicates.contains(&json!({"term": {"categories.raw": "parks"}})));
        assert!(predicates.contains(&json!({"bool": {
            "should": [
                {"term": {"source_path": "/archive"}},
                {"prefix": {"source_path": "/archive/"}}
            ],
            "minimum_should_match": 1
        }})));
        assert!(predicates.contains(&json!({"range": {"date": {"gte": "2023-01-01"}}})));
        assert!(predicates.contains(&json!({"term": {"status": "ingested"}})));
    }

    #[test]
    fn keywords_are_alternatives_with_deterministic_sort() {
        let query = LexicalQuery::from_text("parks levy", QueryFilters::default(), 7);
        let body = lexical_body(&query);

        assert_eq!(body["size"], 7);
        assert_eq!(body["query"]["bool"]["should"].as_array().map(Vec::len), Some(2));
        assert_eq!(body["query"]["bool"]["minimum_should_match"], 1);
        assert_eq!(body["sort"][1], json!({"document_id": "asc"}));
    }

    #[test]
    fn filter_only_query_has_no_should_clause() {
        let query = LexicalQuery {
            keywords: Vec::new(),
            filters: QueryFilters::default(),
            limit: 3,
        };
        assert!(lexical_body(&query)["query"]["bool"].get("should").is_none());
    }

    #[test]
    fn prefix_delete_pages_resume_after_last_id() {
        let first = prefix_page_body("/archive/old/", None);
        assert_eq!(first["size"], PREFIX_DELETE_PAGE);
        assert_eq!(first["query"], json!({"prefix": {"source_path": "/archive/old/"}}));
        assert!(first.get("search_after").is_none());

        let next = prefix_page_body("/archive/old/", Some("doc-42"));
        assert_eq!(next["search_after"], json!(["doc-42"]));
    }

    #[test]
    fn hit_ids_are_read_in_order() {
        let response = json!({"hits": {"hits": [{"_id": "a"}, {"_id": "b"}, {"_score": 1.0}]}});
        assert_eq!(hit_ids(&response), vec!["a".to_string(), "b".to_string()]);
        assert!(hit_ids(&json!({})).is_empty());
    }

    #[test]
    fn empty_hit_list_parses_to_nothing() {
        let response = json!({"hits": {"total": {"value": 0}, "hits": []}});
        assert!(parse_hits(&response).unwrap().is_empty());
        assert!(parse_hits(&json!({})).unwrap().is_empty());
    }
}
