//! Structured metadata extraction through the language model.
//!
//! One request per document. A response that does not validate gets one
//! corrective re-prompt (by default) quoting the validation problem; a second
//! failure is an [`IngestError::ExtractionSchema`].

use crate::chunking::normalize_whitespace;
use crate::config::ModelConfig;
use crate::error::IngestError;
use crate::llm::{complete_with_retry, ChatMessage, LanguageModel, Prompt};
use crate::models::{ExtractionResult, UNKNOWN};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_with::{serde_as, formats::PreferMany, OneOrMany};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "You are an expert assistant for analyzing document content and file metadata. \
Read the provided text and metadata carefully and extract structured information. \
Use the metadata to enrich your understanding. \
You may be given a list of known correct names: if you see garbled or phonetically similar names, use the spelling from the list. \
Respond with a single valid JSON object and nothing else. \
Every key must be present; use \"unknown\" for any string you cannot determine and null for an unknown date.";

const SCHEMA_HINT: &str = r#"{
  "title": "non-empty string, a concise descriptive title",
  "document_set": "string, the collection or series the document belongs to",
  "date": "YYYY-MM-DD or null",
  "entities": ["named people or organizations"],
  "categories": ["topics, most relevant first"],
  "summary": "exactly two sentences"
}"#;

/// Everything the extractor sees about one file.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionInput<'a> {
    pub file_name: &'a str,
    pub text: &'a str,
    pub technical_metadata: &'a BTreeMap<String, String>,
    pub known_names: &'a [String],
}

pub struct MetadataExtractor {
    model: Arc<dyn LanguageModel>,
    config: ModelConfig,
}

impl MetadataExtractor {
    pub fn new(model: Arc<dyn LanguageModel>, config: ModelConfig) -> Self {
        Self { model, config }
    }

    pub async fn extract(&self, input: &ExtractionInput<'_>) -> Result<ExtractionResult, IngestError> {
        let mut prompt = build_prompt(input, self.config.max_prompt_chars);
        let mut corrections = 0u32;

        loop {
            let raw = complete_with_retry(self.model.as_ref(), &prompt, &self.config)
                .await
                .map_err(IngestError::ExtractionUnavailable)?;

            match parse_extraction(&raw, input.known_names) {
                Ok(result) => {
                    debug!(file = input.file_name, corrections, "extraction validated");
                    return Ok(result);
                }
                Err(problem) if corrections < self.config.retry.schema_retries => {
                    corrections += 1;
                    warn!(file = input.file_name, problem = %problem, "extraction failed validation, re-prompting");
                    prompt.messages.push(ChatMessage::assistant(raw));
                    prompt.messages.push(ChatMessage::user(corrective_message(&problem)));
                }
                Err(problem) => return Err(IngestError::ExtractionSchema(problem)),
            }
        }
    }
}

fn build_prompt(input: &ExtractionInput<'_>, max_chars: usize) -> Prompt {
    let metadata = serde_json::to_string_pretty(input.technical_metadata)
        .unwrap_or_else(|_| "{}".to_string());

    let mut user = String::new();
    if !input.known_names.is_empty() {
        user.push_str("Reference list of known correct names:\n");
        for name in input.known_names {
            user.push_str("- ");
            user.push_str(name);
            user.push('\n');
        }
        user.push_str("\n---\n\n");
    }

    user.push_str(&format!("File name: {}\n\n", input.file_name));
    user.push_str(&format!("File metadata:\n```json\n{metadata}\n```\n\n"));

    if input.text.trim().is_empty() {
        user.push_str("Document contains no text. Analyze based on metadata only.\n");
    } else {
        let excerpt: String = input.text.chars().take(max_chars).collect();
        user.push_str(&format!("Document text:\n```\n{excerpt}\n```\n"));
    }

    Prompt::new(SYSTEM_PROMPT, user).with_schema_hint(SCHEMA_HINT)
}

fn corrective_message(problem: &str) -> String {
    format!(
        "Your previous response was rejected: {problem}. \
Reply again with only the corrected JSON object, keeping every required key."
    )
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct RawExtraction {
    title: String,
    document_set: String,
    #[serde(deserialize_with = "Option::deserialize")]
    date: Option<String>,
    #[serde_as(as = "OneOrMany<_, PreferMany>")]
    entities: Vec<String>,
    #[serde_as(as = "OneOrMany<_, PreferMany>")]
    categories: Vec<String>,
    summary: String,
}

/// Parses and validates a model response. The error is a human-readable
/// problem statement that is fed back to the model on re-prompt.
pub fn parse_extraction(raw: &str, known_names: &[String]) -> Result<ExtractionResult, String> {
    let body = json_body(raw).ok_or_else(|| "response contains no JSON object".to_string())?;
    let parsed: RawExtraction =
        serde_json::from_str(body).map_err(|error| format!("invalid JSON for schema: {error}"))?;

    let title = normalize_whitespace(&parsed.title);
    if title.is_empty() {
        return Err("title must be a non-empty string".to_string());
    }

    let document_set = or_unknown(normalize_whitespace(&parsed.document_set));
    let date = parse_date(parsed.date.as_deref())?;

    let summary = normalize_whitespace(&parsed.summary);
    let sentences = count_sentences(&summary);
    if sentences != 2 {
        return Err(format!("summary must be exactly two sentences, found {sentences}"));
    }

    Ok(ExtractionResult {
        title,
        document_set,
        date,
        entities: normalize_entities(&parsed.entities, known_names),
        categories: normalize_categories(&parsed.categories),
        summary,
    })
}

/// Strips markdown fences and any chatter around the outermost object.
fn json_body(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn or_unknown(value: String) -> String {
    if value.is_empty() {
        UNKNOWN.to_string()
    } else {
        value
    }
}

fn is_unknown(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case(UNKNOWN) || value.eq_ignore_ascii_case("n/a")
}

fn parse_date(value: Option<&str>) -> Result<Option<NaiveDate>, String> {
    let Some(value) = value.map(str::trim) else {
        return Ok(None);
    };
    if is_unknown(value) || value.eq_ignore_ascii_case("null") {
        return Ok(None);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| format!("date must be an ISO-8601 date (YYYY-MM-DD) or null, got `{value}`"))
}

/// Counts sentence terminators followed by whitespace or the end of text,
/// plus a trailing unterminated sentence.
fn count_sentences(text: &str) -> usize {
    let chars: Vec<char> = text.trim().chars().collect();
    let mut count = 0;
    let mut pending = false;
    let mut index = 0;

    while index < chars.len() {
        let current = chars[index];
        if matches!(current, '.' | '!' | '?') {
            while index + 1 < chars.len() && matches!(chars[index + 1], '.' | '!' | '?') {
                index += 1;
            }
            let at_boundary = chars
                .get(index + 1)
                .map_or(true, |next| next.is_whitespace() || matches!(next, '"' | '\'' | ')'));
            if at_boundary && pending {
                count += 1;
                pending = false;
            }
        } else if !current.is_whitespace() {
            pending = true;
        }
        index += 1;
    }

    if pending {
        count += 1;
    }
    count
}

fn canonical_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Trims, corrects to the known spelling where one matches, drops unknowns,
/// de-duplicates case-insensitively and sorts.
fn normalize_entities(raw: &[String], known_names: &[String]) -> Vec<String> {
    let known: BTreeMap<String, &String> = known_names
        .iter()
        .map(|name| (canonical_name(name), name))
        .collect();

    let mut normalized: BTreeMap<String, String> = BTreeMap::new();
    for entity in raw {
        let cleaned = normalize_whitespace(entity);
        if is_unknown(&cleaned) {
            continue;
        }
        let key = canonical_name(&cleaned);
        if key.is_empty() {
            continue;
        }
        let display = known
            .get(&key)
            .map(|name| name.to_string())
            .unwrap_or(cleaned);
        normalized.entry(key).or_insert(display);
    }

    let mut entities: Vec<String> = normalized.into_values().collect();
    entities.sort();
    entities
}

fn normalize_categories(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let categories: Vec<String> = raw
        .iter()
        .map(|category| normalize_whitespace(category))
        .filter(|category| !is_unknown(category))
        .filter(|category| seen.insert(category.to_lowercase()))
        .collect();

    if categories.is_empty() {
        vec![UNKNOWN.to_string()]
    } else {
        categories
    }
}
