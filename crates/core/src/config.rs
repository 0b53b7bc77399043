use crate::chunking::ChunkingConfig;
use crate::models::SearchMode;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::time::Duration;

pub const DEFAULT_MODEL_ENDPOINT: &str = "http://localhost:1234/v1";
pub const DEFAULT_KNOWN_NAMES_FILE: &str = "names.txt";

pub const DEFAULT_EXTENSIONS: [&str; 11] = [
    "pdf", "txt", "md", "docx", "jpg", "jpeg", "png", "gif", "mp3", "wav", "m4a",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after an unreachable endpoint or a timeout.
    pub transient_retries: u32,
    /// Corrective re-prompts after a response that fails validation.
    pub schema_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            transient_retries: 1,
            schema_retries: 1,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub endpoint: String,
    pub model: String,
    pub embedding_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Document text beyond this many characters is not sent for extraction.
    pub max_prompt_chars: usize,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_MODEL_ENDPOINT.to_string(),
            model: "local-model".to_string(),
            embedding_model: "local-embedding".to_string(),
            temperature: 0.1,
            max_tokens: 800,
            max_prompt_chars: 12_000,
            request_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Number of ranked units handed to the synthesizer as context.
    pub context_k: usize,
    pub default_mode: SearchMode,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            context_k: 5,
            default_mode: SearchMode::Hybrid,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub workers: usize,
    pub extensions: Vec<String>,
    pub known_names_file: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub store_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tool_timeout: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            extensions: DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
            known_names_file: DEFAULT_KNOWN_NAMES_FILE.to_string(),
            store_timeout: Duration::from_secs(30),
            tool_timeout: Duration::from_secs(30),
        }
    }
}

impl IngestionConfig {
    pub fn accepts_extension(&self, extension: &str) -> bool {
        self.extensions
            .iter()
            .any(|ext| ext.eq_ignore_ascii_case(extension))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub model: ModelConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub ingestion: IngestionConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_serialize_as_seconds() {
        let config = PipelineConfig::default();
        let value = serde_json::to_value(&config).expect("config serializes");
        assert_eq!(value["model"]["request_timeout"], 120);
        assert_eq!(value["ingestion"]["store_timeout"], 30);

        let parsed: PipelineConfig = serde_json::from_value(value).expect("config parses");
        assert_eq!(parsed.model.request_timeout, Duration::from_secs(120));
    }

    #[test]
    fn extension_check_ignores_case() {
        let config = IngestionConfig::default();
        assert!(config.accepts_extension("PDF"));
        assert!(config.accepts_extension("docx"));
        assert!(!config.accepts_extension("exe"));
    }
}
