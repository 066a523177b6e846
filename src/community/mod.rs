//! C13: community detector (spec §4.9).
//!
//! `original_source`'s `community_service.py` delegates entirely to Neo4j
//! GDS's Leiden procedure, which has no equivalent crate in this stack. This
//! module projects the entity subgraph with `petgraph` and runs a
//! from-scratch, deterministic Louvain-style local-moving pass
//! (modularity-optimizing, hierarchical) in its place — see DESIGN.md for
//! the tradeoff.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use futures::stream::{self, StreamExt};
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::domain::{Community, PropertyMap, PropertyValue};
use crate::embedding::EmbeddingClient;
use crate::errors::{CoreError, StoreError};
use crate::graph_store::GraphStore;
use crate::llm::{CompletionRequest, LlmClient, Message};

fn store_err(e: StoreError) -> CoreError {
    CoreError::ExternalPermanent(e.to_string())
}

/// One entity in the projected subgraph (spec §4.9 step 2).
pub struct SubgraphEntity {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub chunk_ids: BTreeSet<String>,
}

/// One relation edge in the projected subgraph.
pub struct SubgraphRelation {
    pub source_id: String,
    pub target_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshOutcome {
    pub levels: usize,
    pub communities_created: usize,
    pub summaries_generated: usize,
    pub summaries_failed: usize,
}

pub struct CommunityDetector<'a> {
    store: &'a dyn GraphStore,
    llm: &'a dyn LlmClient,
    embedding: &'a dyn EmbeddingClient,
    cfg: &'a AppConfig,
}

const AGENT_PREAMBLE: &str = "You summarize a cluster of related entities and their relationships. \
Respond with exactly two lines:\ntitle: <4 words or fewer>\nsummary: <2-3 sentences>";

impl<'a> CommunityDetector<'a> {
    pub fn new(store: &'a dyn GraphStore, llm: &'a dyn LlmClient, embedding: &'a dyn EmbeddingClient, cfg: &'a AppConfig) -> Self {
        Self { store, llm, embedding, cfg }
    }

    /// Runs the full refresh (spec §4.9 steps 1-8).
    pub async fn refresh(
        &self,
        entities: &[SubgraphEntity],
        relations: &[SubgraphRelation],
        chunk_to_document: &HashMap<String, i64>,
    ) -> Result<RefreshOutcome, CoreError> {
        self.store.drop_label("Community").await.map_err(store_err)?;
        self.store.clear_property("Entity", "communities").await.map_err(store_err)?;

        if entities.is_empty() {
            return Ok(RefreshOutcome::default());
        }

        let (graph, _) = project_subgraph(entities, relations);
        let levels = cluster_hierarchy(&graph, self.cfg.community_max_levels);

        for entity in entities {
            let path: Vec<PropertyValue> = levels
                .iter()
                .map(|level| PropertyValue::Number(*level.get(&entity.id).unwrap_or(&0) as f64))
                .collect();
            let mut props = PropertyMap::new();
            props.insert("id".into(), entity.id.clone().into());
            props.insert("communities".into(), PropertyValue::List(path));
            self.store.upsert_node("Entity", "id", props).await.map_err(store_err)?;
        }

        let mut level_node_ids: Vec<HashMap<u32, String>> = Vec::with_capacity(levels.len());
        let mut outcome = RefreshOutcome { levels: levels.len(), ..Default::default() };

        for (level_index, assignment) in levels.iter().enumerate() {
            let level = level_index as u32;
            let mut cluster_members: BTreeMap<u32, Vec<&SubgraphEntity>> = BTreeMap::new();
            for entity in entities {
                let cluster_id = *assignment.get(&entity.id).unwrap_or(&0);
                cluster_members.entry(cluster_id).or_default().push(entity);
            }

            let mut this_level_ids = HashMap::new();
            for (cluster_id, members) in &cluster_members {
                let community = Community::new(level, *cluster_id);
                let node_id = community.id.clone();

                let mut chunk_ids: BTreeSet<&String> = BTreeSet::new();
                for entity in members {
                    chunk_ids.extend(entity.chunk_ids.iter());
                }
                let weight = chunk_ids.len() as u64;
                let documents: HashSet<i64> = chunk_ids.iter().filter_map(|c| chunk_to_document.get(*c).copied()).collect();
                let rank = documents.len() as u64;

                let mut props = PropertyMap::new();
                props.insert("id".into(), node_id.clone().into());
                props.insert("level".into(), (level as f64).into());
                props.insert("weight".into(), (weight as f64).into());
                props.insert("rank".into(), (rank as f64).into());
                self.store.create_node("Community", props).await.map_err(store_err)?;
                outcome.communities_created += 1;

                for entity in members {
                    self.store.create_edge(&entity.id, &node_id, "IN_COMMUNITY", PropertyMap::new()).await.map_err(store_err)?;
                }
                this_level_ids.insert(*cluster_id, node_id);
            }
            level_node_ids.push(this_level_ids);
        }

        for level in 0..level_node_ids.len().saturating_sub(1) {
            for (cluster_id, node_id) in &level_node_ids[level] {
                let representative = entities.iter().find(|e| levels[level].get(&e.id) == Some(cluster_id));
                let Some(entity) = representative else { continue };
                let Some(parent_cluster) = levels[level + 1].get(&entity.id) else { continue };
                let Some(parent_node_id) = level_node_ids[level + 1].get(parent_cluster) else { continue };
                self.store.create_edge(node_id, parent_node_id, "PARENT_COMMUNITY", PropertyMap::new()).await.map_err(store_err)?;
            }
        }

        if let Some(level0_ids) = level_node_ids.first() {
            let mut level0_members: BTreeMap<u32, Vec<&SubgraphEntity>> = BTreeMap::new();
            for entity in entities {
                let cluster_id = *levels[0].get(&entity.id).unwrap_or(&0);
                level0_members.entry(cluster_id).or_default().push(entity);
            }
            let targets: Vec<(String, Vec<&SubgraphEntity>)> = level0_members
                .into_iter()
                .filter(|(_, members)| members.len() > 1)
                .filter_map(|(cluster_id, members)| level0_ids.get(&cluster_id).map(|node_id| (node_id.clone(), members)))
                .collect();

            let relevant_relations: Vec<&SubgraphRelation> = relations.iter().collect();
            let parallelism = self.cfg.community_parallelism.max(1);
            let results: Vec<(String, Option<(String, String)>)> = stream::iter(targets)
                .map(|(node_id, members)| {
                    let relations = &relevant_relations;
                    async move {
                        let summary = self.summarize_community(&members, relations).await;
                        (node_id, summary)
                    }
                })
                .buffer_unordered(parallelism)
                .collect()
                .await;

            for (node_id, summary) in results {
                match summary {
                    Some((title, summary)) => {
                        let embedding = self.embedding.embed(&[summary.clone()], true, self.cfg.embedding_call_policy.max_retries).await;
                        let mut props = PropertyMap::new();
                        props.insert("id".into(), node_id.clone().into());
                        props.insert("title".into(), title.into());
                        props.insert("summary".into(), summary.into());
                        if let Ok(vectors) = embedding {
                            if let Some(vector) = vectors.into_iter().next() {
                                props.insert(
                                    "embedding".into(),
                                    PropertyValue::List(vector.into_iter().map(|v| PropertyValue::Number(v as f64)).collect()),
                                );
                            }
                        }
                        self.store.upsert_node("Community", "id", props).await.map_err(store_err)?;
                        outcome.summaries_generated += 1;
                    }
                    None => {
                        warn!(node_id, "community summary generation failed, leaving community unsummarized");
                        outcome.summaries_failed += 1;
                    }
                }
            }
        }

        self.store.ensure_vector_index("Community", self.cfg.vector_dimension).await.map_err(store_err)?;
        self.store.ensure_full_text_index("Community", "summary").await.map_err(store_err)?;

        info!(
            levels = outcome.levels,
            communities = outcome.communities_created,
            summaries = outcome.summaries_generated,
            failed = outcome.summaries_failed,
            "community refresh complete"
        );
        Ok(outcome)
    }

    /// Invokes the LLM for one level-0 community; `None` on any failure
    /// (spec §4.9 step 6 "failures ... are logged and that community is
    /// left without a summary").
    async fn summarize_community(&self, members: &[&SubgraphEntity], relations: &[&SubgraphRelation]) -> Option<(String, String)> {
        let ids: HashSet<&str> = members.iter().map(|e| e.id.as_str()).collect();
        let local_relations: Vec<String> = relations
            .iter()
            .filter(|r| ids.contains(r.source_id.as_str()) && ids.contains(r.target_id.as_str()))
            .map(|r| format!("{} -> {}", r.source_id, r.target_id))
            .collect();

        let node_lines: Vec<String> = members.iter().map(|e| format!("{} ({})", e.name, e.entity_type)).collect();
        let prompt = format!(
            "Entities:\n{}\n\nRelationships:\n{}",
            node_lines.join("\n"),
            if local_relations.is_empty() { "(none)".to_string() } else { local_relations.join("\n") }
        );

        let request = CompletionRequest {
            messages: vec![Message::system(AGENT_PREAMBLE), Message::user(prompt)],
            tools: None,
            temperature: 0.2,
            max_tokens: 300,
        };

        match self.llm.complete(request).await {
            Ok(response) => match parse_title_summary(&response.content) {
                Some(result) => Some(result),
                None => {
                    error!(content = %response.content, "community summary response missing title/summary lines");
                    None
                }
            },
            Err(e) => {
                error!(error = %e, "community summary LLM call failed");
                None
            }
        }
    }
}

/// Parses the `title: ...` / `summary: ...` response format (spec §4.9
/// step 6).
fn parse_title_summary(content: &str) -> Option<(String, String)> {
    let mut title = None;
    let mut summary = None;
    for line in content.lines() {
        let lower = line.to_lowercase();
        if let Some(rest) = lower.strip_prefix("title:") {
            title = Some(line[line.len() - rest.len()..].trim().to_string());
        } else if let Some(rest) = lower.strip_prefix("summary:") {
            summary = Some(line[line.len() - rest.len()..].trim().to_string());
        }
    }
    match (title, summary) {
        (Some(t), Some(s)) if !t.is_empty() && !s.is_empty() => Some((t, s)),
        _ => None,
    }
}

/// Builds the undirected, weighted entity subgraph: edge weight is the
/// count of parallel relations between two entities (spec §4.9 step 2).
fn project_subgraph(entities: &[SubgraphEntity], relations: &[SubgraphRelation]) -> (UnGraph<String, f64>, HashMap<String, NodeIndex>) {
    let mut graph = UnGraph::new_undirected();
    let mut index_of = HashMap::with_capacity(entities.len());
    for entity in entities {
        let idx = graph.add_node(entity.id.clone());
        index_of.insert(entity.id.clone(), idx);
    }

    let mut weight_of: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for relation in relations {
        if relation.source_id == relation.target_id {
            continue;
        }
        let (Some(&a), Some(&b)) = (index_of.get(&relation.source_id), index_of.get(&relation.target_id)) else {
            continue;
        };
        let key = if a.index() < b.index() { (a.index(), b.index()) } else { (b.index(), a.index()) };
        *weight_of.entry(key).or_insert(0.0) += 1.0;
    }
    for ((a, b), weight) in weight_of {
        graph.add_edge(NodeIndex::new(a), NodeIndex::new(b), weight);
    }
    (graph, index_of)
}

/// Runs up to `max_levels` rounds of [`louvain_pass`], coarsening the graph
/// between rounds, and returns the per-level assignment of every original
/// entity id to its cluster at that level (spec §4.9 step 3).
fn cluster_hierarchy(graph: &UnGraph<String, f64>, max_levels: u32) -> Vec<HashMap<String, u32>> {
    let mut levels = Vec::new();
    let mut current = graph.clone();
    let mut members_of: HashMap<NodeIndex, Vec<String>> =
        graph.node_indices().map(|idx| (idx, vec![graph[idx].clone()])).collect();

    loop {
        if levels.len() as u32 >= max_levels || current.node_count() == 0 {
            break;
        }
        let assignment = louvain_pass(&current);
        let distinct: HashSet<u32> = assignment.values().copied().collect();

        let mut level_assignment: HashMap<String, u32> = HashMap::new();
        for (idx, members) in &members_of {
            let cluster = *assignment.get(idx).unwrap_or(&0);
            for original in members {
                level_assignment.insert(original.clone(), cluster);
            }
        }
        levels.push(level_assignment);

        if distinct.len() <= 1 || distinct.len() == current.node_count() {
            break;
        }

        let mut next_graph: UnGraph<String, f64> = UnGraph::new_undirected();
        let mut cluster_to_index: HashMap<u32, NodeIndex> = HashMap::new();
        let mut next_members: HashMap<NodeIndex, Vec<String>> = HashMap::new();
        for &cluster in &distinct {
            let idx = next_graph.add_node(format!("c{cluster}"));
            cluster_to_index.insert(cluster, idx);
        }
        for (node_idx, members) in &members_of {
            let cluster = *assignment.get(node_idx).unwrap_or(&0);
            let next_idx = cluster_to_index[&cluster];
            next_members.entry(next_idx).or_default().extend(members.iter().cloned());
        }

        let mut next_weight: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for edge in current.edge_references() {
            let cluster_a = *assignment.get(&edge.source()).unwrap_or(&0);
            let cluster_b = *assignment.get(&edge.target()).unwrap_or(&0);
            if cluster_a == cluster_b {
                continue;
            }
            let idx_a = cluster_to_index[&cluster_a].index();
            let idx_b = cluster_to_index[&cluster_b].index();
            let key = if idx_a < idx_b { (idx_a, idx_b) } else { (idx_b, idx_a) };
            *next_weight.entry(key).or_insert(0.0) += *edge.weight();
        }
        for ((a, b), weight) in next_weight {
            next_graph.add_edge(NodeIndex::new(a), NodeIndex::new(b), weight);
        }

        current = next_graph;
        members_of = next_members;
    }

    levels
}

/// One deterministic local-moving pass: repeatedly moves each node into
/// the neighboring community that maximizes modularity gain, until no
/// node moves or a bounded number of sweeps elapses. A from-scratch,
/// simplified stand-in for Leiden (see module docs).
fn louvain_pass(graph: &UnGraph<String, f64>) -> HashMap<NodeIndex, u32> {
    let nodes: Vec<NodeIndex> = graph.node_indices().collect();
    if nodes.is_empty() {
        return HashMap::new();
    }

    let mut degree: HashMap<NodeIndex, f64> = HashMap::new();
    let mut neighbors: HashMap<NodeIndex, Vec<(NodeIndex, f64)>> = HashMap::new();
    for &node in &nodes {
        let mut total = 0.0;
        let mut adj = Vec::new();
        for edge in graph.edges(node) {
            let other = if edge.source() == node { edge.target() } else { edge.source() };
            let weight = *edge.weight();
            total += weight;
            adj.push((other, weight));
        }
        degree.insert(node, total);
        neighbors.insert(node, adj);
    }
    let m: f64 = degree.values().sum::<f64>() / 2.0;

    let mut community: HashMap<NodeIndex, u32> = nodes.iter().enumerate().map(|(i, &n)| (n, i as u32)).collect();
    if m <= 0.0 {
        return renumber(&community, &nodes);
    }
    let mut sum_tot: HashMap<u32, f64> = community.iter().map(|(&n, &c)| (c, degree[&n])).collect();

    let mut pass = 0;
    loop {
        let mut improved = false;
        pass += 1;
        for &node in &nodes {
            let current_community = community[&node];
            let k_i = degree[&node];
            *sum_tot.get_mut(&current_community).unwrap() -= k_i;

            let mut weight_to_community: HashMap<u32, f64> = HashMap::new();
            for &(other, weight) in &neighbors[&node] {
                if other == node {
                    continue;
                }
                *weight_to_community.entry(community[&other]).or_insert(0.0) += weight;
            }

            let mut best_community = current_community;
            let mut best_gain = weight_to_community.get(&current_community).copied().unwrap_or(0.0)
                - sum_tot.get(&current_community).copied().unwrap_or(0.0) * k_i / (2.0 * m);

            let mut candidates: Vec<u32> = weight_to_community.keys().copied().collect();
            candidates.sort();
            for candidate in candidates {
                if candidate == current_community {
                    continue;
                }
                let k_i_in = weight_to_community.get(&candidate).copied().unwrap_or(0.0);
                let gain = k_i_in - sum_tot.get(&candidate).copied().unwrap_or(0.0) * k_i / (2.0 * m);
                if gain > best_gain {
                    best_gain = gain;
                    best_community = candidate;
                }
            }

            if best_community != current_community {
                improved = true;
            }
            community.insert(node, best_community);
            *sum_tot.entry(best_community).or_insert(0.0) += k_i;
        }
        if !improved || pass >= 20 {
            break;
        }
    }

    renumber(&community, &nodes)
}

/// Compacts cluster ids to a dense `0..k` range, in deterministic
/// first-seen order over `nodes`.
fn renumber(community: &HashMap<NodeIndex, u32>, nodes: &[NodeIndex]) -> HashMap<NodeIndex, u32> {
    let mut seen: HashMap<u32, u32> = HashMap::new();
    let mut next_id = 0u32;
    let mut result = HashMap::with_capacity(nodes.len());
    for &node in nodes {
        let raw = community[&node];
        let id = *seen.entry(raw).or_insert_with(|| {
            let id = next_id;
            next_id += 1;
            id
        });
        result.insert(node, id);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::embedding::EmbeddingClient;
    use crate::graph_store::memory::InMemoryGraphStore;
    use crate::llm::{CompletionResponse, LlmClient};
    use async_trait::async_trait;

    fn entity(id: &str, chunk: &str) -> SubgraphEntity {
        SubgraphEntity { id: id.to_string(), name: id.to_string(), entity_type: "organization".into(), chunk_ids: std::iter::once(chunk.to_string()).collect() }
    }

    #[test]
    fn two_disconnected_pairs_form_two_clusters() {
        let entities = vec![entity("a", "c1"), entity("b", "c1"), entity("c", "c2"), entity("d", "c2")];
        let relations = vec![
            SubgraphRelation { source_id: "a".into(), target_id: "b".into() },
            SubgraphRelation { source_id: "c".into(), target_id: "d".into() },
        ];
        let (graph, _) = project_subgraph(&entities, &relations);
        let assignment = louvain_pass(&graph);
        let cluster_of = |id: &str| assignment[&graph.node_indices().find(|&i| graph[i] == id).unwrap()];
        assert_eq!(cluster_of("a"), cluster_of("b"));
        assert_eq!(cluster_of("c"), cluster_of("d"));
        assert_ne!(cluster_of("a"), cluster_of("c"));
    }

    #[test]
    fn isolated_nodes_become_singleton_clusters() {
        let entities = vec![entity("a", "c1"), entity("b", "c2")];
        let (graph, _) = project_subgraph(&entities, &[]);
        let assignment = louvain_pass(&graph);
        assert_eq!(assignment.len(), 2);
        assert_ne!(assignment.values().collect::<HashSet<_>>().len(), 0);
    }

    struct StubLlm;
    #[async_trait]
    impl LlmClient for StubLlm {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, CoreError> {
            Ok(CompletionResponse { content: "title: Tech Cluster\nsummary: A group of related technology entities.".into(), tool_calls: vec![] })
        }
    }

    struct StubEmbedding;
    #[async_trait]
    impl EmbeddingClient for StubEmbedding {
        async fn embed(&self, texts: &[String], _use_cache: bool, _max_retries: u32) -> Result<Vec<Vec<f32>>, CoreError> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2]).collect())
        }
        fn dimension(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn refresh_creates_communities_and_summarizes_multi_entity_clusters() {
        let store = InMemoryGraphStore::new();
        let llm = StubLlm;
        let embedding = StubEmbedding;
        let cfg = AppConfig::for_tests();
        let detector = CommunityDetector::new(&store, &llm, &embedding, &cfg);

        let entities = vec![entity("a", "chunk1"), entity("b", "chunk1")];
        let relations = vec![SubgraphRelation { source_id: "a".into(), target_id: "b".into() }];
        let mut chunk_to_document = HashMap::new();
        chunk_to_document.insert("chunk1".to_string(), 1i64);

        let outcome = detector.refresh(&entities, &relations, &chunk_to_document).await.unwrap();
        assert!(outcome.communities_created >= 1);
        assert_eq!(outcome.summaries_generated, 1);
    }

    #[test]
    fn parses_title_and_summary_lines() {
        let content = "title: Example Co\nsummary: A short blurb about the cluster.";
        let (title, summary) = parse_title_summary(content).unwrap();
        assert_eq!(title, "Example Co");
        assert!(summary.contains("blurb"));
    }
}
