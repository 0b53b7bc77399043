use crate::config::ModelConfig;
use crate::error::SearchError;
use crate::llm::{complete_with_retry, LanguageModel, Prompt};
use crate::models::{Answer, RankedHit};
use regex::{Captures, Regex};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "You answer questions about an archive of documents. \
Use only the numbered context passages supplied by the user; if they do not contain \
the answer, say so. Cite every passage you rely on inline as [doc:ID], using the ID \
shown in the passage header exactly. Never cite an ID that is not in the context.";

/// Answers a question from retrieved passages and keeps only the citations
/// that point into those passages.
pub struct RagSynthesizer {
    model: Arc<dyn LanguageModel>,
    config: ModelConfig,
    context_k: usize,
    citation: Regex,
}

impl RagSynthesizer {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        config: &ModelConfig,
        context_k: usize,
    ) -> Result<Self, SearchError> {
        Ok(Self {
            model,
            config: config.clone(),
            context_k: context_k.max(1),
            citation: Regex::new(r"\s?\[doc:([A-Za-z0-9_-]+)\]")?,
        })
    }

    /// No hits means nothing to ground on: the answer is `None` and the
    /// model is not called.
    pub async fn synthesize(&self, query: &str, hits: Vec<RankedHit>) -> Result<Answer, SearchError> {
        if hits.is_empty() {
            return Ok(Answer {
                answer: None,
                citations: Vec::new(),
                hits,
            });
        }

        let context = &hits[..hits.len().min(self.context_k)];
        let allowed: HashSet<&str> = context.iter().map(|hit| hit.document_id.as_str()).collect();
        let prompt = build_prompt(query, context);

        let raw = match complete_with_retry(self.model.as_ref(), &prompt, &self.config).await {
            Ok(raw) => raw,
            Err(details) => {
                warn!(error = %details, hits = hits.len(), "synthesis unavailable, returning raw hits");
                return Err(SearchError::SynthesisUnavailable { details, hits });
            }
        };

        let (answer, citations) = self.ground_citations(&raw, &allowed);
        debug!(context = context.len(), citations = citations.len(), "answer synthesized");

        Ok(Answer {
            answer: Some(answer),
            citations,
            hits,
        })
    }

    /// Returns the answer with unsupported citation markers removed, and the
    /// supported ids in order of first appearance.
    fn ground_citations(&self, raw: &str, allowed: &HashSet<&str>) -> (String, Vec<String>) {
        let mut citations: Vec<String> = Vec::new();
        let mut stripped: Vec<String> = Vec::new();

        let cleaned = self.citation.replace_all(raw, |captures: &Captures<'_>| {
            let id = &captures[1];
            if allowed.contains(id) {
                if !citations.iter().any(|cited| cited == id) {
                    citations.push(id.to_string());
                }
                captures[0].to_string()
            } else {
                stripped.push(id.to_string());
                String::new()
            }
        });

        if !stripped.is_empty() {
            warn!(stripped = ?stripped, "removed citations outside the supplied context");
        }

        (cleaned.trim().to_string(), citations)
    }
}

fn build_prompt(query: &str, context: &[RankedHit]) -> Prompt {
    let mut user = String::from("Context:\n\n");
    for (position, hit) in context.iter().enumerate() {
        user.push_str(&format!(
            "[{}] [doc:{}] {}\n{}\n\n",
            position + 1,
            hit.document_id,
            hit.title,
            hit.text.trim()
        ));
    }
    user.push_str(&format!("---\n\nQuestion: {}\n", query.trim()));

    Prompt::new(SYSTEM_PROMPT, user)
}
