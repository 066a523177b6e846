//! C7: knowledge extractor (spec §4.3).
//!
//! Implements the closed-type-set, validated, regex-fallback,
//! retry/backoff, and pacing contract spec §4.3 describes.

use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::config::AppConfig;
use crate::domain::ids::{extraction_entity_id, extraction_relation_id};
use crate::domain::{Chunk, Entity, PropertyMap, Relation};
use crate::errors::CoreError;
use crate::llm::{CompletionRequest, LlmClient, Message};

#[derive(Debug, Deserialize, Default)]
struct RawExtraction {
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    relationships: Vec<RawRelation>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    name: String,
    #[serde(rename = "type")]
    entity_type: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
    #[serde(default)]
    start_char: Option<usize>,
    #[serde(default)]
    end_char: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawRelation {
    source: String,
    target: String,
    #[serde(rename = "type")]
    relation_type: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
}

fn default_confidence() -> f32 {
    0.7
}

#[derive(Debug, Default)]
pub struct ExtractionResult {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

pub struct Extractor<'a> {
    llm: &'a dyn LlmClient,
    cfg: &'a AppConfig,
}

impl<'a> Extractor<'a> {
    pub fn new(llm: &'a dyn LlmClient, cfg: &'a AppConfig) -> Self {
        Self { llm, cfg }
    }

    /// Extracts entities and relations from a single chunk (spec §4.3:
    /// "For each chunk, issues one LLM call").
    pub async fn extract(&self, chunk: &Chunk) -> ExtractionResult {
        let prompt = build_prompt(&self.cfg.entity_types, &self.cfg.relation_types, &chunk.text);
        let request = CompletionRequest {
            messages: vec![Message::system(SYSTEM_PREAMBLE), Message::user(prompt)],
            tools: None,
            temperature: 0.1,
            max_tokens: 2000,
        };

        tokio::time::sleep(self.cfg.llm_min_interval).await;

        match self.llm.complete(request).await {
            Ok(response) => self.parse_or_fallback(chunk, &response.content),
            Err(e) => {
                warn!(chunk_id = %chunk.id, error = %e, "extraction LLM call failed after retries, skipping chunk");
                ExtractionResult::default()
            }
        }
    }

    fn parse_or_fallback(&self, chunk: &Chunk, content: &str) -> ExtractionResult {
        match parse_json_response(content) {
            Some(raw) => self.to_domain(chunk, raw),
            None => {
                warn!(chunk_id = %chunk.id, "extraction JSON parse failed, using regex fallback");
                regex_fallback(chunk)
            }
        }
    }

    fn to_domain(&self, chunk: &Chunk, raw: RawExtraction) -> ExtractionResult {
        let mut entities = Vec::new();
        let mut entity_name_to_id = std::collections::HashMap::new();

        for (i, raw_entity) in raw.entities.into_iter().enumerate() {
            let entity_type = self.cfg.normalize_entity_type(&raw_entity.entity_type);
            let id = extraction_entity_id(&chunk.id, i);
            let name_len = raw_entity.name.chars().count();
            if !(crate::domain::entity::MIN_NAME_LEN..=crate::domain::entity::MAX_NAME_LEN).contains(&name_len) {
                continue;
            }
            if raw_entity.confidence < crate::domain::entity::MIN_ENTITY_CONFIDENCE {
                continue;
            }
            entity_name_to_id.insert(raw_entity.name.to_lowercase(), id.clone());
            let now = Utc::now();
            entities.push(Entity {
                id,
                name: raw_entity.name,
                entity_type,
                description: raw_entity.description,
                properties: PropertyMap::new(),
                confidence: raw_entity.confidence,
                source_text_excerpt: excerpt(&chunk.text, raw_entity.start_char, raw_entity.end_char),
                start_char: raw_entity.start_char,
                end_char: raw_entity.end_char,
                aliases: Default::default(),
                embedding: None,
                quality_score: raw_entity.confidence,
                importance_score: 0.0,
                merged_from: Default::default(),
                chunk_ids: std::iter::once(chunk.id.clone()).collect(),
                created_at: now,
                updated_at: now,
            });
        }

        let mut relations = Vec::new();
        for (j, raw_relation) in raw.relationships.into_iter().enumerate() {
            let source_id = entity_name_to_id.get(&raw_relation.source.to_lowercase());
            let target_id = entity_name_to_id.get(&raw_relation.target.to_lowercase());
            let (Some(source_id), Some(target_id)) = (source_id, target_id) else {
                continue;
            };
            if source_id == target_id || raw_relation.confidence < crate::domain::relation::MIN_RELATION_CONFIDENCE {
                continue;
            }
            let relation_type = normalize_relation_type(&raw_relation.relation_type, &self.cfg.relation_types);
            relations.push(Relation {
                id: extraction_relation_id(&chunk.id, j),
                source_id: source_id.clone(),
                source_name: raw_relation.source,
                target_id: target_id.clone(),
                target_name: raw_relation.target,
                relation_type,
                description: raw_relation.description,
                properties: PropertyMap::new(),
                confidence: raw_relation.confidence,
                source_text_excerpt: chunk.text.clone(),
                chunk_id: chunk.id.clone(),
            });
        }

        ExtractionResult { entities, relations }
    }
}

fn excerpt(text: &str, start: Option<usize>, end: Option<usize>) -> String {
    match (start, end) {
        (Some(s), Some(e)) if s < e && e <= text.chars().count() => text.chars().skip(s).take(e - s).collect(),
        _ => text.chars().take(200).collect(),
    }
}

fn normalize_relation_type(candidate: &str, known: &[String]) -> String {
    let lowered = candidate.to_lowercase();
    known.iter().find(|k| k.eq_ignore_ascii_case(&lowered)).cloned().unwrap_or(lowered)
}

const SYSTEM_PREAMBLE: &str = "You extract entities and relationships from text for a knowledge graph. \
Respond with a single JSON object and nothing else.";

fn build_prompt(entity_types: &[String], relation_types: &[String], text: &str) -> String {
    format!(
        "Entity types: {}\nRelation types: {}\n\n\
         Extract entities and relationships from the text below. Return a JSON object with keys \
         \"entities\" (each: name, type, description, confidence, start_char, end_char) and \
         \"relationships\" (each: source, target, type, description, confidence). Use only the listed \
         types; if nothing applies use \"concept\". Return empty lists if nothing is found.\n\n\
         Text:\n{text}",
        entity_types.join(", "),
        relation_types.join(", "),
    )
}

/// Parses the LLM's JSON response, stripping Markdown code fences if
/// present (spec §4.3 "robust to fenced code blocks").
fn parse_json_response(content: &str) -> Option<RawExtraction> {
    let trimmed = content.trim().trim_start_matches("```json").trim_start_matches("```").trim_end_matches("```").trim();
    serde_json::from_str(trimmed).ok()
}

/// Best-effort fallback when JSON parsing fails: extracts capitalized
/// word runs as plausible entity names at confidence 0.5, type `concept`
/// (spec §4.3 "Failure policy").
fn regex_fallback(chunk: &Chunk) -> ExtractionResult {
    let pattern = Regex::new(r"\b([A-Z][a-zA-Z]+(?:\s+[A-Z][a-zA-Z]+)*)\b").expect("static regex is valid");
    let mut seen = std::collections::HashSet::new();
    let mut entities = Vec::new();
    for (i, m) in pattern.find_iter(&chunk.text).enumerate() {
        let name = m.as_str().to_string();
        if name.chars().count() < crate::domain::entity::MIN_NAME_LEN {
            continue;
        }
        if !seen.insert(name.to_lowercase()) {
            continue;
        }
        let now = Utc::now();
        entities.push(Entity {
            id: extraction_entity_id(&chunk.id, i),
            name,
            entity_type: "concept".to_string(),
            description: String::new(),
            properties: PropertyMap::new(),
            confidence: 0.5,
            source_text_excerpt: chunk.text.chars().take(200).collect(),
            start_char: Some(m.start()),
            end_char: Some(m.end()),
            aliases: Default::default(),
            embedding: None,
            quality_score: 0.5,
            importance_score: 0.0,
            merged_from: Default::default(),
            chunk_ids: std::iter::once(chunk.id.clone()).collect(),
            created_at: now,
            updated_at: now,
        });
    }
    ExtractionResult { entities, relations: Vec::new() }
}

/// Retries an `ExternalTransient` failure up to `max_retries` times with
/// exponential backoff (spec §4.3 "Failure policy"), used by callers that
/// drive the extractor directly rather than through a pre-wrapped
/// `RetryingLlmClient`.
pub async fn with_exponential_backoff<F, Fut, T>(max_retries: u32, base: Duration, mut f: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, CoreError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries && e.is_retryable() => {
                attempt += 1;
                tokio::time::sleep(base * 2u32.pow(attempt - 1)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn sample_chunk() -> Chunk {
        crate::domain::chunk::new_chunk(
            "c1".into(),
            1,
            0,
            0,
            20,
            "Apple Inc. makes phones".into(),
            crate::domain::ChunkType::Content,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn parses_well_formed_json_response() {
        let cfg = AppConfig::for_tests();
        let json = r#"{"entities":[{"name":"Apple Inc.","type":"organization","description":"tech company","confidence":0.9}],"relationships":[]}"#;
        let llm = MockLlmClient { fixed_content: Some(json.to_string()) };
        let extractor = Extractor::new(&llm, &cfg);
        let result = extractor.extract(&sample_chunk()).await;
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].entity_type, "organization");
    }

    #[tokio::test]
    async fn falls_back_to_regex_on_parse_failure() {
        let cfg = AppConfig::for_tests();
        let llm = MockLlmClient { fixed_content: Some("not json at all".to_string()) };
        let extractor = Extractor::new(&llm, &cfg);
        let result = extractor.extract(&sample_chunk()).await;
        assert!(!result.entities.is_empty());
        assert!(result.entities.iter().all(|e| e.entity_type == "concept"));
    }

    #[test]
    fn strips_fenced_code_blocks() {
        let content = "```json\n{\"entities\":[],\"relationships\":[]}\n```";
        let parsed = parse_json_response(content);
        assert!(parsed.is_some());
    }

    #[test]
    fn low_confidence_relations_are_dropped() {
        let cfg = AppConfig::for_tests();
        let llm = MockLlmClient { fixed_content: None };
        let extractor = Extractor::new(&llm, &cfg);
        let raw = RawExtraction {
            entities: vec![
                RawEntity { name: "Alice".into(), entity_type: "person".into(), description: String::new(), confidence: 0.9, start_char: None, end_char: None },
                RawEntity { name: "Bob".into(), entity_type: "person".into(), description: String::new(), confidence: 0.9, start_char: None, end_char: None },
            ],
            relationships: vec![RawRelation { source: "Alice".into(), target: "Bob".into(), relation_type: "knows".into(), description: String::new(), confidence: 0.2 }],
        };
        let result = extractor.to_domain(&sample_chunk(), raw);
        assert_eq!(result.relations.len(), 0);
    }
}
