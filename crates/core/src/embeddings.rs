use crate::config::ModelConfig;
use crate::error::ModelError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Maps text to a fixed-length vector. Implementations must return the same
/// vector for the same input; ingestion and query embedding share one.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError>;
}

#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        // Texts shorter than a trigram hash their characters one by one.
        let width = if chars.len() < 3 { 1 } else { 3 };
        for window in chars.windows(width) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        Ok(self.embed_sync(text))
    }
}

/// Embeddings from an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    endpoint: String,
    model: String,
    dimensions: usize,
    client: Client,
}

impl OpenAiEmbedder {
    pub fn new(config: &ModelConfig, dimensions: usize) -> Result<Self, ModelError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| ModelError::Unavailable(error.to_string()))?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.embedding_model.clone(),
            dimensions,
            client,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        let url = format!("{}/embeddings", self.endpoint);
        debug!(url = %url, chars = text.len(), "requesting embedding");

        let response = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ModelError::Unavailable(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }

        let payload: Value = response.json().await?;
        let vector = parse_embedding(&payload)?;
        if vector.len() != self.dimensions {
            return Err(ModelError::Malformed(format!(
                "embedding dimension {} != {}",
                vector.len(),
                self.dimensions
            )));
        }
        Ok(vector)
    }
}

fn parse_embedding(payload: &Value) -> Result<Vec<f32>, ModelError> {
    payload
        .pointer("/data/0/embedding")
        .and_then(Value::as_array)
        .ok_or_else(|| ModelError::Malformed("response has no data[0].embedding".to_string()))?
        .iter()
        .map(|value| {
            value
                .as_f64()
                .map(|number| number as f32)
                .ok_or_else(|| ModelError::Malformed("embedding holds a non-number".to_string()))
        })
        .collect()
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() {
        return 0.0;
    }

    let dot: f32 = left.iter().zip(right.iter()).map(|(x, y)| x * y).sum();
    let norm_left: f32 = left.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_right: f32 = right.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_left == 0.0 || norm_right == 0.0 {
        return 0.0;
    }

    dot / (norm_left * norm_right)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("Minutes of the parks committee, March 2019").await.unwrap();
        let second = embedder.embed("Minutes of the parks committee, March 2019").await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed_sync("abc");
        assert_eq!(vector.len(), 32);
    }

    #[test]
    fn short_text_still_gets_a_direction() {
        let embedder = CharacterNgramEmbedder::default();
        let vector = embedder.embed_sync("Q3");
        assert!(vector.iter().any(|value| *value > 0.0));
        assert!(cosine_similarity(&vector, &embedder.embed_sync("q3")) > 0.99);
        assert!(embedder.embed_sync("").iter().all(|value| *value == 0.0));
    }

    #[test]
    fn similar_text_scores_higher_than_unrelated_text() {
        let embedder = CharacterNgramEmbedder::default();
        let query = embedder.embed_sync("parks and recreation budget");
        let close = embedder.embed_sync("the parks budget for recreation");
        let far = embedder.embed_sync("zebra xylophone quartz");
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn embedding_payload_is_parsed() {
        let payload = json!({ "data": [{ "embedding": [0.5, -0.25, 1.0] }] });
        assert_eq!(parse_embedding(&payload).unwrap(), vec![0.5, -0.25, 1.0]);

        let missing = json!({ "data": [] });
        assert!(matches!(parse_embedding(&missing), Err(ModelError::Malformed(_))));
    }

    #[test]
    fn cosine_of_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
    }
}
