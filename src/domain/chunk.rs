//! The `Chunk` record (spec §3, §4.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Content,
    Heading,
    Section,
    Subsection,
}

/// An ordered, bounded-length span of a document's plain text (spec §3, GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: i64,
    pub index: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub text: String,
    pub word_count: usize,
    pub paragraph_count: usize,
    pub chunk_type: ChunkType,
    pub section_title: Option<String>,
    pub heading_level: Option<u8>,
    pub created_at: DateTime<Utc>,
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn content_length(&self) -> usize {
        self.text.chars().count()
    }
}

/// Unicode-aware word count (spec §3's `word_count`), using word-boundary
/// segmentation rather than ASCII whitespace splitting so accented and
/// non-Latin scripts count correctly.
fn word_count(text: &str) -> usize {
    text.unicode_words().count()
}

fn paragraph_count(text: &str) -> usize {
    text.split("\n\n").filter(|p| !p.trim().is_empty()).count().max(1)
}

/// Builds a `Chunk` from raw parameters, computing word/paragraph counts.
pub fn new_chunk(
    id: String,
    document_id: i64,
    index: usize,
    start_char: usize,
    end_char: usize,
    text: String,
    chunk_type: ChunkType,
    section_title: Option<String>,
    heading_level: Option<u8>,
) -> Chunk {
    Chunk {
        word_count: word_count(&text),
        paragraph_count: paragraph_count(&text),
        id,
        document_id,
        index,
        start_char,
        end_char,
        text,
        chunk_type,
        section_title,
        heading_level,
        created_at: Utc::now(),
        embedding: None,
    }
}
