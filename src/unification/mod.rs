//! C10: unification agent (spec §4.6).
//!
//! A finite-state machine (`vector-prescreen -> intelligent-analysis ->
//! final-decision -> done`, plus `error-recovery`) driving a bounded
//! multi-turn LLM dialogue with a `search_wikipedia` tool. Grounded on the
//! extractor's JSON-parse-with-fallback pattern (the same
//! fenced-code-stripping logic is reused) and on the embedding client for
//! on-demand vector generation.

use std::collections::{HashMap, HashSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::domain::Entity;
use crate::embedding::EmbeddingClient;
use crate::graph_store::cosine_similarity_unit;
use crate::llm::{CompletionRequest, LlmClient, Message, ToolCall, ToolSchema};
use crate::similarity::embedding_representation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    VectorPrescreen,
    IntelligentAnalysis,
    FinalDecision,
    Done,
    ErrorRecovery,
}

#[derive(Debug, Clone)]
pub struct CandidateEntity {
    pub entity: Entity,
    /// Whether this candidate came from the existing graph (a sample of
    /// same-type entities) rather than the document just ingested. Used to
    /// bias primary selection (spec §4.6 step 3).
    pub from_graph: bool,
}

#[derive(Debug, Clone)]
pub struct MergeGroup {
    pub primary_index: usize,
    pub duplicate_indices: Vec<usize>,
    pub merged_name: String,
    pub merged_description: String,
    pub confidence: f32,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct UnificationOutcome {
    pub merge_groups: Vec<MergeGroup>,
    pub independent_indices: Vec<usize>,
    pub uncertain_indices: Vec<usize>,
    pub trace: Vec<String>,
    pub errors: Vec<String>,
    pub final_state: Option<AgentState>,
}

#[derive(Debug, Clone)]
struct PrescreenedPair {
    a: usize,
    b: usize,
    similarity: f32,
}

#[derive(Debug, Deserialize)]
struct RawGroup {
    primary_index: usize,
    duplicate_indices: Vec<usize>,
    #[serde(default)]
    merged_name: Option<String>,
    #[serde(default)]
    merged_description: Option<String>,
    #[serde(default = "default_group_confidence")]
    confidence: f32,
    #[serde(default)]
    reason: String,
}

fn default_group_confidence() -> f32 {
    0.8
}

#[derive(Debug, Deserialize, Default)]
struct RawAgentOutput {
    #[serde(default)]
    merge_groups: Vec<RawGroup>,
    #[serde(default)]
    independent_entities: Vec<usize>,
    #[serde(default)]
    uncertain_cases: Vec<usize>,
}

pub struct UnificationAgent<'a> {
    llm: &'a dyn LlmClient,
    embedding: &'a dyn EmbeddingClient,
    cfg: &'a AppConfig,
}

impl<'a> UnificationAgent<'a> {
    pub fn new(llm: &'a dyn LlmClient, embedding: &'a dyn EmbeddingClient, cfg: &'a AppConfig) -> Self {
        Self { llm, embedding, cfg }
    }

    /// Runs the full state machine over one batch, sub-batching when the
    /// input exceeds `max_pairs_per_batch` (spec §4.6 "Batching").
    pub async fn run(&self, candidates: Vec<CandidateEntity>) -> UnificationOutcome {
        if candidates.len() <= self.cfg.max_pairs_per_batch {
            return self.run_batch(candidates, 0).await;
        }

        let mut merged = UnificationOutcome::default();
        let mut offset = 0;
        for chunk in candidates.chunks(self.cfg.max_pairs_per_batch) {
            let outcome = self.run_batch(chunk.to_vec(), offset).await;
            merged.merge_groups.extend(outcome.merge_groups);
            merged.independent_indices.extend(outcome.independent_indices);
            merged.uncertain_indices.extend(outcome.uncertain_indices);
            merged.trace.extend(outcome.trace);
            merged.errors.extend(outcome.errors);
            offset += chunk.len();
        }
        merged.final_state = Some(AgentState::Done);
        reconcile_cross_batch_primaries(&mut merged, &candidates);
        merged
    }

    async fn run_batch(&self, mut candidates: Vec<CandidateEntity>, index_offset: usize) -> UnificationOutcome {
        let mut outcome = UnificationOutcome::default();

        if let Err(e) = self.ensure_embeddings(&mut candidates).await {
            outcome.errors.push(e);
            outcome.independent_indices = (0..candidates.len()).map(|i| i + index_offset).collect();
            outcome.final_state = Some(AgentState::ErrorRecovery);
            return outcome;
        }

        let pairs = self.prescreen(&candidates);
        if pairs.is_empty() {
            outcome.independent_indices = (0..candidates.len()).map(|i| i + index_offset).collect();
            outcome.final_state = Some(AgentState::Done);
            return outcome;
        }

        match self.intelligent_analysis(&candidates, &pairs, &mut outcome.trace).await {
            Ok(raw) => {
                let (groups, independent, uncertain) = self.final_decision(&candidates, raw, &outcome.trace);
                outcome.merge_groups = groups.into_iter().map(|g| offset_group(g, index_offset)).collect();
                outcome.independent_indices = independent.into_iter().map(|i| i + index_offset).collect();
                outcome.uncertain_indices = uncertain.into_iter().map(|i| i + index_offset).collect();
                outcome.final_state = Some(AgentState::Done);
            }
            Err(e) => {
                warn!(error = %e, "unification agent entered error-recovery");
                outcome.errors.push(e);
                outcome.independent_indices = (0..candidates.len()).map(|i| i + index_offset).collect();
                outcome.final_state = Some(AgentState::ErrorRecovery);
            }
        }
        outcome
    }

    /// State 1: ensure every candidate has an embedding.
    async fn ensure_embeddings(&self, candidates: &mut [CandidateEntity]) -> Result<(), String> {
        let missing: Vec<usize> = candidates.iter().enumerate().filter(|(_, c)| c.entity.embedding.is_none()).map(|(i, _)| i).collect();
        if missing.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = missing.iter().map(|&i| embedding_representation(&candidates[i].entity)).collect();
        let vectors = self
            .embedding
            .embed(&texts, true, self.cfg.embedding_call_policy.max_retries)
            .await
            .map_err(|e| format!("embedding generation failed: {e}"))?;
        for (&i, vector) in missing.iter().zip(vectors.into_iter()) {
            candidates[i].entity.embedding = Some(vector);
        }
        Ok(())
    }

    /// State 1 continued: pairwise cosine similarity, filtered by the
    /// prescreen threshold (spec §4.6 step 1).
    fn prescreen(&self, candidates: &[CandidateEntity]) -> Vec<PrescreenedPair> {
        let mut pairs = Vec::new();
        for i in 0..candidates.len() {
            for j in (i + 1)..candidates.len() {
                let (Some(ea), Some(eb)) = (&candidates[i].entity.embedding, &candidates[j].entity.embedding) else {
                    continue;
                };
                let similarity = cosine_similarity_unit(ea, eb);
                if similarity >= self.cfg.unification_prescreen_threshold {
                    pairs.push(PrescreenedPair { a: i, b: j, similarity });
                }
            }
        }
        pairs
    }

    /// State 2: bounded multi-turn dialogue with a `search_wikipedia` tool.
    async fn intelligent_analysis(
        &self,
        candidates: &[CandidateEntity],
        pairs: &[PrescreenedPair],
        trace: &mut Vec<String>,
    ) -> Result<RawAgentOutput, String> {
        let mut messages = vec![Message::system(AGENT_PREAMBLE), Message::user(build_analysis_prompt(candidates, pairs))];
        let tools = vec![ToolSchema {
            name: "search_wikipedia".into(),
            description: "Look up an entity name and type to check for redirect/alias evidence".into(),
            parameters: serde_json::to_value(schemars::schema_for!(SearchWikipediaArgs))
                .expect("JsonSchema-derived schema always serializes"),
        }];

        for turn in 0..self.cfg.max_agent_iterations {
            let request =
                CompletionRequest { messages: messages.clone(), tools: Some(tools.clone()), temperature: 0.0, max_tokens: 2000 };
            let response = self.llm.complete(request).await.map_err(|e| format!("agent turn {turn} failed: {e}"))?;

            if !response.tool_calls.is_empty() {
                for call in &response.tool_calls {
                    let result = execute_tool_call(call);
                    trace.push(format!("call {}({}) -> {}", call.name, call.args, result));
                    messages.push(Message { role: crate::llm::Role::Assistant, content: format!("tool_call:{}", call.name) });
                    messages.push(Message { role: crate::llm::Role::Tool, content: result });
                }
                continue;
            }

            return parse_agent_output(&response.content).ok_or_else(|| "agent final answer was not valid JSON".to_string());
        }
        Err(format!("exceeded max_agent_iterations ({})", self.cfg.max_agent_iterations))
    }

    /// State 3: validates the agent's output and applies the primary-bias
    /// rule (spec §4.6 step 3), then runs the conservatism guard.
    fn final_decision(&self, candidates: &[CandidateEntity], raw: RawAgentOutput, trace: &[String]) -> (Vec<MergeGroup>, Vec<usize>, Vec<usize>) {
        let n = candidates.len();
        let mut claimed: HashSet<usize> = HashSet::new();
        let mut groups = Vec::new();

        for raw_group in raw.merge_groups {
            if raw_group.primary_index >= n || raw_group.duplicate_indices.iter().any(|&i| i >= n) {
                continue;
            }
            if raw_group.duplicate_indices.contains(&raw_group.primary_index) {
                continue;
            }
            let mut members: Vec<usize> = std::iter::once(raw_group.primary_index).chain(raw_group.duplicate_indices.iter().copied()).collect();
            if members.iter().any(|i| claimed.contains(i)) {
                continue;
            }

            let primary_index = bias_primary(candidates, &members);
            members.retain(|&i| i != primary_index);
            let duplicate_indices = members;

            let primary_entity = &candidates[primary_index].entity;
            let group = MergeGroup {
                primary_index,
                duplicate_indices: duplicate_indices.clone(),
                merged_name: raw_group.merged_name.unwrap_or_else(|| primary_entity.name.clone()),
                merged_description: raw_group.merged_description.unwrap_or_else(|| primary_entity.description.clone()),
                confidence: raw_group.confidence,
                reason: raw_group.reason,
            };

            claimed.insert(primary_index);
            claimed.extend(duplicate_indices.iter());
            groups.push(group);
        }

        let groups = self.conservatism_guard(candidates, groups, trace);

        // Recompute from the post-guard groups: a group the guard rejects
        // must release its members back to independent/uncertain instead of
        // leaving them claimed-but-homeless.
        let claimed: HashSet<usize> = groups.iter().flat_map(|g| std::iter::once(g.primary_index).chain(g.duplicate_indices.iter().copied())).collect();

        let mut independent: Vec<usize> = raw.independent_entities.into_iter().filter(|i| *i < n && !claimed.contains(i)).collect();
        let mut uncertain: Vec<usize> = raw.uncertain_cases.into_iter().filter(|i| *i < n && !claimed.contains(i)).collect();

        for i in 0..n {
            if !claimed.contains(&i) && !independent.contains(&i) && !uncertain.contains(&i) {
                independent.push(i);
            }
        }

        (groups, independent, uncertain)
    }

    /// Rechecks each proposed merge: a type-heterogeneous group, or a group
    /// whose confidence is below 0.95 with no tool-call evidence in the
    /// agent's trace, is downgraded (dropped back to independent) rather
    /// than applied (spec §4.6 "Conservatism guard"). The LLM's free-text
    /// `reason` is self-reported and not trusted as evidence on its own.
    fn conservatism_guard(&self, candidates: &[CandidateEntity], groups: Vec<MergeGroup>, trace: &[String]) -> Vec<MergeGroup> {
        groups
            .into_iter()
            .filter(|group| {
                let all_indices = std::iter::once(group.primary_index).chain(group.duplicate_indices.iter().copied());
                let types: HashSet<&str> = all_indices.map(|i| candidates[i].entity.entity_type.as_str()).collect();
                if types.len() > 1 {
                    return false;
                }
                if group.confidence < 0.95 && !group_has_trace_evidence(candidates, group, trace) {
                    return false;
                }
                true
            })
            .collect()
    }
}

/// Whether the agent's tool-call trace contains evidence (a `search_wikipedia`
/// call result) naming one of `group`'s member entities, as opposed to the
/// agent merely asserting a reason with no investigation behind it.
fn group_has_trace_evidence(candidates: &[CandidateEntity], group: &MergeGroup, trace: &[String]) -> bool {
    let member_names: Vec<&str> =
        std::iter::once(group.primary_index).chain(group.duplicate_indices.iter().copied()).map(|i| candidates[i].entity.name.as_str()).collect();
    trace.iter().any(|line| member_names.iter().any(|name| line.contains(name)))
}

fn bias_primary(candidates: &[CandidateEntity], members: &[usize]) -> usize {
    members
        .iter()
        .copied()
        .find(|&i| candidates[i].from_graph)
        .unwrap_or_else(|| members.iter().copied().min().expect("members is non-empty"))
}

fn offset_group(mut group: MergeGroup, offset: usize) -> MergeGroup {
    group.primary_index += offset;
    group.duplicate_indices = group.duplicate_indices.into_iter().map(|i| i + offset).collect();
    group
}

/// Second pass across sub-batches: merges any primaries sharing a
/// `(canonical name, type)` (spec §4.6 "Batching").
fn reconcile_cross_batch_primaries(outcome: &mut UnificationOutcome, candidates: &[CandidateEntity]) {
    let mut by_key: HashMap<String, usize> = HashMap::new();
    let mut merged_groups: Vec<MergeGroup> = Vec::new();

    for group in outcome.merge_groups.drain(..) {
        let entity = &candidates[group.primary_index].entity;
        let key = format!("{}|{}", crate::domain::ids::canonicalize(&entity.name), entity.entity_type);
        if let Some(&existing_idx) = by_key.get(&key) {
            let existing: &mut MergeGroup = &mut merged_groups[existing_idx];
            existing.duplicate_indices.push(group.primary_index);
            existing.duplicate_indices.extend(group.duplicate_indices);
        } else {
            by_key.insert(key, merged_groups.len());
            merged_groups.push(group);
        }
    }
    outcome.merge_groups = merged_groups;
}

/// Tool-call argument shape for `search_wikipedia`, used only to derive the
/// JSON schema advertised to the LLM (spec §4.6's single supported tool).
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct SearchWikipediaArgs {
    entity_name: String,
    entity_type: String,
}

fn execute_tool_call(call: &ToolCall) -> String {
    let name = call.args.get("entity_name").and_then(|v| v.as_str()).unwrap_or("unknown");
    format!("No redirect or alias evidence found for '{name}'.")
}

const AGENT_PREAMBLE: &str = "You are an ultra-conservative deduplication engineer for a knowledge graph. \
Only propose a merge when evidence is explicit: identical canonical names, well-known aliases or \
abbreviations, translations, or redirect-style evidence. Never merge competitors, different people with \
similar roles, different organizations in the same industry, or entities of different types. \
Respond with a single JSON object {\"merge_groups\": [...], \"independent_entities\": [...], \"uncertain_cases\": [...]} \
once you are done investigating.";

fn build_analysis_prompt(candidates: &[CandidateEntity], pairs: &[PrescreenedPair]) -> String {
    let mut out = String::from("Candidates:\n");
    for (i, candidate) in candidates.iter().enumerate() {
        out.push_str(&format!(
            "[{i}] name={} type={} description={} aliases={:?}\n",
            candidate.entity.name, candidate.entity.entity_type, candidate.entity.description, candidate.entity.aliases
        ));
    }
    out.push_str("\nPrescreened pairs (index, index, vector similarity):\n");
    for pair in pairs {
        out.push_str(&format!("({}, {}, {:.3})\n", pair.a, pair.b, pair.similarity));
    }
    out
}

fn parse_agent_output(content: &str) -> Option<RawAgentOutput> {
    let trimmed = content.trim().trim_start_matches("```json").trim_start_matches("```").trim_end_matches("```").trim();
    serde_json::from_str(trimmed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::build_embedding_client;
    use crate::llm::MockLlmClient;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn candidate(name: &str, entity_type: &str, from_graph: bool) -> CandidateEntity {
        let now = Utc::now();
        CandidateEntity {
            entity: Entity {
                id: format!("e_{name}"),
                name: name.into(),
                entity_type: entity_type.into(),
                description: String::new(),
                properties: Default::default(),
                confidence: 0.9,
                source_text_excerpt: String::new(),
                start_char: None,
                end_char: None,
                aliases: BTreeSet::new(),
                embedding: None,
                quality_score: 0.9,
                importance_score: 0.0,
                merged_from: BTreeSet::new(),
                chunk_ids: BTreeSet::new(),
                created_at: now,
                updated_at: now,
            },
            from_graph,
        }
    }

    #[tokio::test]
    async fn empty_prescreen_marks_everyone_independent() {
        let cfg = AppConfig::for_tests();
        let llm = MockLlmClient { fixed_content: None };
        let embedding = build_embedding_client(&cfg);
        let agent = UnificationAgent::new(&llm, embedding.as_ref(), &cfg);

        // Orthogonal embeddings guarantee the prescreen finds nothing.
        let mut a = candidate("Apple Inc.", "organization", false);
        a.entity.embedding = Some(vec![1.0, 0.0]);
        let mut b = candidate("Totally Different Co", "organization", false);
        b.entity.embedding = Some(vec![0.0, 1.0]);

        let outcome = agent.run(vec![a, b]).await;
        assert_eq!(outcome.independent_indices.len(), 2);
        assert!(outcome.merge_groups.is_empty());
    }

    #[tokio::test]
    async fn valid_merge_group_is_accepted() {
        let cfg = AppConfig::for_tests();
        let json = r#"{"merge_groups":[{"primary_index":0,"duplicate_indices":[1],"merged_name":"Apple","merged_description":"d","confidence":0.97,"reason":"identical canonical name"}],"independent_entities":[],"uncertain_cases":[]}"#;
        let llm = MockLlmClient { fixed_content: Some(json.to_string()) };
        let embedding = build_embedding_client(&cfg);
        let agent = UnificationAgent::new(&llm, embedding.as_ref(), &cfg);

        let mut a = candidate("Apple Inc.", "organization", true);
        a.entity.embedding = Some(vec![1.0, 0.0]);
        let mut b = candidate("Apple", "organization", false);
        b.entity.embedding = Some(vec![1.0, 0.0]);

        let outcome = agent.run(vec![a, b]).await;
        assert_eq!(outcome.merge_groups.len(), 1);
        assert_eq!(outcome.merge_groups[0].primary_index, 0);
    }

    #[test]
    fn conservatism_guard_rejects_heterogeneous_types() {
        let cfg = AppConfig::for_tests();
        let llm = MockLlmClient { fixed_content: None };
        let dummy_embedding = build_embedding_client(&cfg);
        let agent = UnificationAgent::new(&llm, dummy_embedding.as_ref(), &cfg);
        let candidates = vec![candidate("A", "organization", false), candidate("B", "person", false)];
        let groups = vec![MergeGroup {
            primary_index: 0,
            duplicate_indices: vec![1],
            merged_name: "A".into(),
            merged_description: String::new(),
            confidence: 0.99,
            reason: "evidence".into(),
        }];
        let filtered = agent.conservatism_guard(&candidates, groups, &[]);
        assert!(filtered.is_empty());
    }

    #[test]
    fn conservatism_guard_rejects_low_confidence_with_no_trace_evidence() {
        let cfg = AppConfig::for_tests();
        let llm = MockLlmClient { fixed_content: None };
        let dummy_embedding = build_embedding_client(&cfg);
        let agent = UnificationAgent::new(&llm, dummy_embedding.as_ref(), &cfg);
        let candidates = vec![candidate("Acme Corp", "organization", false), candidate("Acme", "organization", false)];
        let groups = vec![MergeGroup {
            primary_index: 0,
            duplicate_indices: vec![1],
            merged_name: "Acme Corp".into(),
            merged_description: String::new(),
            confidence: 0.7,
            reason: "looks like an abbreviation".into(),
        }];

        let no_evidence = agent.conservatism_guard(&candidates, groups.clone(), &[]);
        assert!(no_evidence.is_empty());

        let trace = vec!["call search_wikipedia({\"entity_name\":\"Acme\"}) -> redirects to Acme Corp".to_string()];
        let with_evidence = agent.conservatism_guard(&candidates, groups, &trace);
        assert_eq!(with_evidence.len(), 1);
    }
}
