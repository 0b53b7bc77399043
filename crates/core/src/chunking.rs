use crate::error::IngestError;
use crate::models::{Chunk, Document};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Upper bound on chunk length, in characters.
    pub max_chars: usize,
    /// Fraction of `max_chars` repeated at the start of the next chunk.
    pub overlap_fraction: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 500,
            overlap_fraction: 0.1,
        }
    }
}

impl ChunkingConfig {
    pub fn new(max_chars: usize, overlap_fraction: f32) -> Self {
        Self {
            max_chars,
            overlap_fraction,
        }
    }

    pub fn overlap_chars(&self) -> usize {
        (self.max_chars as f64 * f64::from(self.overlap_fraction)).floor() as usize
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_chars must be greater than zero".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.overlap_fraction) {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap_fraction must be in [0, 1), got {}",
                self.overlap_fraction
            )));
        }
        Ok(())
    }
}

/// A contiguous slice of document text, addressed by character offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// Splits `text` into overlapping windows of at most `max_chars` characters.
///
/// A window that would cut through a word is pulled back to the last
/// whitespace in its final quarter. Every following window starts exactly
/// `overlap_chars` before the previous end, so the spans cover the text with
/// no gaps and the result depends only on `text` and `config`.
pub fn split_text(text: &str, config: &ChunkingConfig) -> Result<Vec<ChunkSpan>, IngestError> {
    config.validate()?;

    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Ok(Vec::new());
    }

    let overlap = config.overlap_chars();
    let mut spans = Vec::new();
    let mut start = 0usize;

    loop {
        let hard_end = (start + config.max_chars).min(chars.len());
        let end = if hard_end == chars.len() {
            hard_end
        } else {
            let min_end = (start + overlap + 1).max(hard_end - config.max_chars / 4);
            (min_end..hard_end)
                .rev()
                .find(|&candidate| chars[candidate - 1].is_whitespace())
                .unwrap_or(hard_end)
        };

        spans.push(ChunkSpan {
            start,
            end,
            text: chars[start..end].iter().collect(),
        });

        if end == chars.len() {
            break;
        }
        start = end - overlap;
    }

    Ok(spans)
}

/// Builds the full chunk set for one document version. Embeddings are left
/// empty for the caller to fill.
pub fn build_chunks(document: &Document, config: &ChunkingConfig) -> Result<Vec<Chunk>, IngestError> {
    let metadata = document.chunk_metadata();

    split_text(&document.text, config)?
        .into_iter()
        .enumerate()
        .map(|(ordinal, span)| {
            let ordinal = u32::try_from(ordinal).map_err(|_| {
                IngestError::Chunking(format!(
                    "document {} produced more chunks than an ordinal can address",
                    document.document_id
                ))
            })?;

            Ok(Chunk {
                chunk_id: make_chunk_id(&document.document_id, &document.content_hash, ordinal),
                document_id: document.document_id.clone(),
                ordinal,
                start: span.start,
                end: span.end,
                text: span.text,
                embedding: Vec::new(),
                metadata: metadata.clone(),
            })
        })
        .collect()
}

fn make_chunk_id(document_id: &str, content_hash: &str, ordinal: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(content_hash.as_bytes());
    hasher.update(ordinal.to_le_bytes());
    format!("{:x}", hasher.finalize())
}
