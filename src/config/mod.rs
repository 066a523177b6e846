//! Application configuration, loaded once at startup from the environment
//! (spec §6 "Configuration") via `AppConfig::from_env`, covering every knob
//! spec §6 enumerates.

use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
    Mock,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            "mock" => Ok(Self::Mock),
            other => Err(anyhow!("unsupported LLM provider: {other}")),
        }
    }
}

/// Default unification mode (spec §6), also the selectable mode of the
/// unification-trigger endpoint (spec §6 "Inbound API").
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnificationMode {
    Incremental,
    Sampling,
    GlobalSemantic,
}

impl UnificationMode {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "incremental" => Ok(Self::Incremental),
            "sampling" => Ok(Self::Sampling),
            "global_semantic" => Ok(Self::GlobalSemantic),
            other => Err(anyhow!("unsupported unification mode: {other}")),
        }
    }
}

/// Weights for the three similarity axes (spec §4.4).
#[derive(Clone, Copy, Debug)]
pub struct SimilarityWeights {
    pub semantic: f32,
    pub lexical: f32,
    pub contextual: f32,
}

/// Decision thresholds (spec §4.5).
#[derive(Clone, Copy, Debug)]
pub struct SimilarityThresholds {
    pub high: f32,
    pub medium: f32,
    pub low: f32,
}

/// Per-call timeout/retry policy shared by embedding, LLM, and graph-store
/// calls (spec §5 "Cancellation and timeouts").
#[derive(Clone, Copy, Debug)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

/// Complete application configuration (spec §6).
#[derive(Clone, Debug)]
pub struct AppConfig {
    // --- Store connectivity ---
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub server_addr: String,
    pub object_store_dir: String,

    // --- LLM / embedding ---
    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,
    pub llm_chat_model: String,
    pub vector_dimension: usize,

    // --- Closed type sets (spec §3 `Entity`/`Relation` invariants) ---
    pub entity_types: Vec<String>,
    pub relation_types: Vec<String>,

    // --- Similarity & merge decision (spec §4.4, §4.5) ---
    pub similarity_weights: SimilarityWeights,
    pub similarity_thresholds: SimilarityThresholds,

    // --- Unification agent (spec §4.6) ---
    pub unification_mode_default: UnificationMode,
    pub unification_prescreen_threshold: f32,
    pub max_pairs_per_batch: usize,
    pub max_agent_iterations: u32,

    // --- Community detection (spec §4.9) ---
    pub community_max_levels: u32,
    pub community_parallelism: usize,

    // --- Embedding batching & caching (spec §4.10) ---
    pub embedding_batch_size: usize,

    // --- Pipeline I/O-bound sub-worker pool (spec §5, default 4-10) ---
    pub extraction_parallelism: usize,

    // --- Graph merger (spec §4.8) ---
    pub alias_max: usize,

    // --- Call policies (spec §5) ---
    pub llm_call_policy: CallPolicy,
    pub embedding_call_policy: CallPolicy,
    pub graph_call_policy: CallPolicy,

    // --- Pacing & rate limiting (spec §4.3, §5) ---
    pub llm_min_interval: Duration,
    pub llm_error_backoff: Duration,
    pub rate_limit_per_second: u32,

    // --- Backpressure (spec §5) ---
    pub task_queue_capacity: usize,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn default_entity_types() -> Vec<String> {
    [
        "person",
        "organization",
        "location",
        "event",
        "concept",
        "technology",
        "product",
        "time",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_relation_types() -> Vec<String> {
    [
        "contains",
        "belongs_to",
        "located_in",
        "works_for",
        "causes",
        "uses",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl AppConfig {
    /// Loads configuration from environment variables (using `.env` if present).
    pub fn from_env() -> Result<Self> {
        let neo4j_uri = env::var("NEO4J_URI").map_err(|_| anyhow!("missing NEO4J_URI"))?;
        let neo4j_user = env::var("NEO4J_USER").map_err(|_| anyhow!("missing NEO4J_USER"))?;
        let neo4j_password = env::var("NEO4J_PASSWORD").map_err(|_| anyhow!("missing NEO4J_PASSWORD"))?;
        let server_addr = env_or("SERVER_ADDR", "127.0.0.1:3322");
        let object_store_dir = env_or("OBJECT_STORE_DIR", "./data/objects");

        let llm_provider = LlmProvider::from_str(&env_or("LLM_PROVIDER", "openai"))?;
        let llm_embedding_model = env_or("LLM_EMBEDDING_MODEL", "text-embedding-3-small");
        let llm_chat_model = env_or("LLM_CHAT_MODEL", "gpt-4o-mini");
        let vector_dimension = env_parse("VECTOR_DIMENSION", 1536usize);

        let entity_types = env::var("ENTITY_TYPES")
            .map(|v| v.split(',').map(|s| s.trim().to_lowercase()).collect())
            .unwrap_or_else(|_| default_entity_types());
        let relation_types = env::var("RELATION_TYPES")
            .map(|v| v.split(',').map(|s| s.trim().to_lowercase()).collect())
            .unwrap_or_else(|_| default_relation_types());

        let similarity_weights = SimilarityWeights {
            semantic: env_parse("SIMILARITY_WEIGHT_SEMANTIC", 0.4),
            lexical: env_parse("SIMILARITY_WEIGHT_LEXICAL", 0.3),
            contextual: env_parse("SIMILARITY_WEIGHT_CONTEXTUAL", 0.3),
        };
        let similarity_thresholds = SimilarityThresholds {
            high: env_parse("SIMILARITY_THRESHOLD_HIGH", 0.85),
            medium: env_parse("SIMILARITY_THRESHOLD_MEDIUM", 0.65),
            low: env_parse("SIMILARITY_THRESHOLD_LOW", 0.50),
        };

        let unification_mode_default =
            UnificationMode::from_str(&env_or("UNIFICATION_MODE_DEFAULT", "incremental"))?;
        let unification_prescreen_threshold = env_parse("UNIFICATION_PRESCREEN_THRESHOLD", 0.4);
        let max_pairs_per_batch = env_parse("MAX_PAIRS_PER_BATCH", 30usize);
        let max_agent_iterations = env_parse("MAX_AGENT_ITERATIONS", 5u32);

        let community_max_levels = env_parse("COMMUNITY_MAX_LEVELS", 3u32);
        let community_parallelism = env_parse("COMMUNITY_PARALLELISM", 10usize);

        let embedding_batch_size = env_parse("EMBEDDING_BATCH_SIZE", 50usize);
        let extraction_parallelism = env_parse("EXTRACTION_PARALLELISM", 8usize);
        let alias_max = env_parse("ALIAS_MAX", 20usize);

        let llm_call_policy = CallPolicy {
            timeout: Duration::from_secs(env_parse("LLM_TIMEOUT_SECS", 120u64)),
            max_retries: env_parse("LLM_MAX_RETRIES", 3u32),
        };
        let embedding_call_policy = CallPolicy {
            timeout: Duration::from_secs(env_parse("EMBEDDING_TIMEOUT_SECS", 30u64)),
            max_retries: env_parse("EMBEDDING_MAX_RETRIES", 3u32),
        };
        let graph_call_policy = CallPolicy {
            timeout: Duration::from_secs(env_parse("GRAPH_TIMEOUT_SECS", 30u64)),
            max_retries: env_parse("GRAPH_MAX_RETRIES", 3u32),
        };

        let llm_min_interval = Duration::from_millis(env_parse("LLM_MIN_INTERVAL_MS", 100u64));
        let llm_error_backoff = Duration::from_millis(env_parse("LLM_ERROR_BACKOFF_MS", 500u64));
        let rate_limit_per_second = env_parse("RATE_LIMIT_PER_SECOND", 10u32);

        let task_queue_capacity = env_parse("TASK_QUEUE_CAPACITY", 10_000usize);

        Ok(Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            server_addr,
            object_store_dir,
            llm_provider,
            llm_embedding_model,
            llm_chat_model,
            vector_dimension,
            entity_types,
            relation_types,
            similarity_weights,
            similarity_thresholds,
            unification_mode_default,
            unification_prescreen_threshold,
            max_pairs_per_batch,
            max_agent_iterations,
            community_max_levels,
            community_parallelism,
            embedding_batch_size,
            extraction_parallelism,
            alias_max,
            llm_call_policy,
            embedding_call_policy,
            graph_call_policy,
            llm_min_interval,
            llm_error_backoff,
            rate_limit_per_second,
            task_queue_capacity,
        })
    }

    /// Remaps an unrecognized type to the nearest configured one, or falls
    /// back to `concept` (spec §3 `Entity` invariant).
    pub fn normalize_entity_type(&self, candidate: &str) -> String {
        let lowered = candidate.to_lowercase();
        if self.entity_types.contains(&lowered) {
            return lowered;
        }
        self.entity_types
            .iter()
            .find(|known| lowered.contains(known.as_str()) || known.contains(&lowered))
            .cloned()
            .unwrap_or_else(|| "concept".to_string())
    }

    /// A config suitable for unit tests and mock runs: mock LLM provider,
    /// small dimensions, defaults otherwise.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            neo4j_uri: "bolt://localhost:7687".into(),
            neo4j_user: "neo4j".into(),
            neo4j_password: "test".into(),
            server_addr: "127.0.0.1:0".into(),
            object_store_dir: std::env::temp_dir().join("kg-core-tests").to_string_lossy().into_owned(),
            llm_provider: LlmProvider::Mock,
            llm_embedding_model: "mock-embed".into(),
            llm_chat_model: "mock-chat".into(),
            vector_dimension: 32,
            entity_types: default_entity_types(),
            relation_types: default_relation_types(),
            similarity_weights: SimilarityWeights { semantic: 0.4, lexical: 0.3, contextual: 0.3 },
            similarity_thresholds: SimilarityThresholds { high: 0.85, medium: 0.65, low: 0.50 },
            unification_mode_default: UnificationMode::Incremental,
            unification_prescreen_threshold: 0.4,
            max_pairs_per_batch: 30,
            max_agent_iterations: 5,
            community_max_levels: 3,
            community_parallelism: 10,
            embedding_batch_size: 50,
            extraction_parallelism: 4,
            alias_max: 20,
            llm_call_policy: CallPolicy { timeout: Duration::from_secs(1), max_retries: 3 },
            embedding_call_policy: CallPolicy { timeout: Duration::from_secs(1), max_retries: 3 },
            graph_call_policy: CallPolicy { timeout: Duration::from_secs(1), max_retries: 3 },
            llm_min_interval: Duration::from_millis(0),
            llm_error_backoff: Duration::from_millis(0),
            rate_limit_per_second: 1000,
            task_queue_capacity: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_unknown_type_to_concept() {
        let cfg = AppConfig::for_tests();
        assert_eq!(cfg.normalize_entity_type("gadget"), "concept");
        assert_eq!(cfg.normalize_entity_type("Person"), "person");
    }

    #[test]
    fn unification_mode_parses() {
        assert_eq!(UnificationMode::from_str("global_semantic").unwrap(), UnificationMode::GlobalSemantic);
        assert!(UnificationMode::from_str("bogus").is_err());
    }
}
