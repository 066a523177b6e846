//! C1: embedding client (spec §4.10).
//!
//! Implements the full contract: `embed(texts, use_cache, max_retries) ->
//! Vec<Vec<f32>>`, with an in-process cache keyed by case-folded/
//! whitespace-collapsed text, retry with backoff, and a deterministic
//! pseudo-random fallback vector on persistent failure so downstream
//! pipeline steps never crash on an embedding outage.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroU32;
use std::sync::Mutex;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::config::{AppConfig, LlmProvider};
use crate::errors::CoreError;

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embeds `texts` in order. The output length always equals the input
    /// length and every vector has the configured dimension, even when the
    /// provider call ultimately fails for some inputs (spec §4.10).
    async fn embed(&self, texts: &[String], use_cache: bool, max_retries: u32) -> Result<Vec<Vec<f32>>, CoreError>;

    fn dimension(&self) -> usize;
}

/// Case-folds and collapses whitespace so `"Foo  Bar"` and `"foo bar"` share
/// a cache entry (spec §4.10 "identical strings ... return cached vectors").
fn cache_key(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// A deterministic pseudo-random vector seeded by the input's hash, used
/// both by the mock client and as the fallback on persistent provider
/// failure (spec §4.10).
fn pseudo_random_vector(seed_text: &str, dimension: usize) -> Vec<f32> {
    let mut hasher = DefaultHasher::new();
    seed_text.hash(&mut hasher);
    let seed = hasher.finish();
    let mut rng = StdRng::seed_from_u64(seed);
    (0..dimension).map(|_| rng.gen_range(-1.0f32..1.0f32)).collect()
}

/// Shared cache + retry/backoff scaffolding around a provider-specific
/// `embed_batch` call. Concrete clients (OpenAI via rig-core, or the mock)
/// implement `ProviderEmbed`; `embed()` on the wrapping client applies the
/// cache and retry/fallback policy uniformly (spec §4.10, §5 concurrency
/// "embedding clients are stateless and safely concurrent, the embedding
/// cache is protected by a mutex").
#[async_trait]
trait ProviderEmbed: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError>;
    fn dimension(&self) -> usize;
}

struct CachingEmbeddingClient<P: ProviderEmbed> {
    provider: P,
    cache: Mutex<std::collections::HashMap<String, Vec<f32>>>,
}

impl<P: ProviderEmbed> CachingEmbeddingClient<P> {
    fn new(provider: P) -> Self {
        Self { provider, cache: Mutex::new(std::collections::HashMap::new()) }
    }
}

#[async_trait]
impl<P: ProviderEmbed + Send + Sync> EmbeddingClient for CachingEmbeddingClient<P> {
    async fn embed(&self, texts: &[String], use_cache: bool, max_retries: u32) -> Result<Vec<Vec<f32>>, CoreError> {
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<usize> = Vec::new();

        if use_cache {
            let cache = self.cache.lock().map_err(|_| CoreError::Logic("embedding cache mutex poisoned".into()))?;
            for (i, text) in texts.iter().enumerate() {
                if let Some(vector) = cache.get(&cache_key(text)) {
                    out[i] = Some(vector.clone());
                } else {
                    misses.push(i);
                }
            }
        } else {
            misses = (0..texts.len()).collect();
        }

        if !misses.is_empty() {
            let miss_texts: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
            let fetched = self.fetch_with_retry(&miss_texts, max_retries).await;
            if use_cache {
                let mut cache = self.cache.lock().map_err(|_| CoreError::Logic("embedding cache mutex poisoned".into()))?;
                for (&i, vector) in misses.iter().zip(fetched.iter()) {
                    cache.insert(cache_key(&texts[i]), vector.clone());
                }
            }
            for (&i, vector) in misses.iter().zip(fetched.into_iter()) {
                out[i] = Some(vector);
            }
        }

        Ok(out.into_iter().map(|v| v.expect("every index is filled by cache hit or fetch")).collect())
    }

    fn dimension(&self) -> usize {
        self.provider.dimension()
    }
}

impl<P: ProviderEmbed + Send + Sync> CachingEmbeddingClient<P> {
    async fn fetch_with_retry(&self, texts: &[String], max_retries: u32) -> Vec<Vec<f32>> {
        let mut attempt = 0;
        loop {
            match self.provider.embed_batch(texts).await {
                Ok(vectors) => return vectors,
                Err(e) if attempt < max_retries && e.is_retryable() => {
                    attempt += 1;
                    warn!(attempt, error = %e, "embedding call failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(e) => {
                    warn!(error = %e, "embedding call failed permanently, falling back to pseudo-random vectors");
                    return texts.iter().map(|t| pseudo_random_vector(t, self.provider.dimension())).collect();
                }
            }
        }
    }
}

/// Token-bucket throttle in front of an embedding client (spec §5
/// "Backpressure": embedding calls are paced to `cfg.rate_limit_per_second`
/// the same as LLM calls, see `llm::RateLimitedLlmClient`).
struct RateLimitedEmbeddingClient<P> {
    provider: P,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl<P: EmbeddingClient> RateLimitedEmbeddingClient<P> {
    fn new(provider: P, per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(nonzero!(1u32));
        Self { provider, limiter: RateLimiter::direct(Quota::per_second(rate)) }
    }
}

#[async_trait]
impl<P: EmbeddingClient> EmbeddingClient for RateLimitedEmbeddingClient<P> {
    async fn embed(&self, texts: &[String], use_cache: bool, max_retries: u32) -> Result<Vec<Vec<f32>>, CoreError> {
        self.limiter.until_ready().await;
        self.provider.embed(texts, use_cache, max_retries).await
    }

    fn dimension(&self) -> usize {
        self.provider.dimension()
    }
}

struct MockProvider {
    dimension: usize,
}

#[async_trait]
impl ProviderEmbed for MockProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        Ok(texts.iter().map(|t| pseudo_random_vector(t, self.dimension)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

struct OpenAiProvider {
    model: String,
    dimension: usize,
}

#[async_trait]
impl ProviderEmbed for OpenAiProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        use rig::client::EmbeddingsClient as _;
        use rig::embeddings::EmbeddingModel;
        use rig::providers::openai;

        let client = openai::Client::from_env();
        let embedding_model = client.embedding_model(&self.model);
        let embeddings = embedding_model
            .embed_texts(texts.to_vec())
            .await
            .map_err(|e| CoreError::ExternalTransient(format!("openai embeddings: {e}")))?;

        if embeddings.len() != texts.len() {
            return Err(CoreError::ExternalPermanent(format!(
                "openai returned {} embeddings for {} inputs",
                embeddings.len(),
                texts.len()
            )));
        }
        Ok(embeddings.into_iter().map(|e| e.vec.into_iter().map(|v| v as f32).collect()).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Builds the embedding client named by `cfg.llm_provider`. Only OpenAI and
/// Mock are wired (spec §4.10 "a test/mock mode is selectable via
/// configuration"); other providers fall back to Mock with a warning,
/// leaving them unimplemented for later.
pub fn build_embedding_client(cfg: &AppConfig) -> Box<dyn EmbeddingClient> {
    match cfg.llm_provider {
        LlmProvider::OpenAI => Box::new(RateLimitedEmbeddingClient::new(
            CachingEmbeddingClient::new(OpenAiProvider { model: cfg.llm_embedding_model.clone(), dimension: cfg.vector_dimension }),
            cfg.rate_limit_per_second,
        )),
        ref other => {
            if !matches!(other, LlmProvider::Mock) {
                warn!(provider = ?other, "embedding provider not implemented, using mock");
            }
            Box::new(RateLimitedEmbeddingClient::new(
                CachingEmbeddingClient::new(MockProvider { dimension: cfg.vector_dimension }),
                cfg.rate_limit_per_second,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn output_length_matches_input_and_dimension_is_configured() {
        let client = CachingEmbeddingClient::new(MockProvider { dimension: 8 });
        let texts = vec!["hello world".to_string(), "second text".to_string()];
        let vectors = client.embed(&texts, true, 0).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|v| v.len() == 8));
    }

    #[tokio::test]
    async fn identical_case_folded_strings_share_a_cache_entry() {
        let client = CachingEmbeddingClient::new(MockProvider { dimension: 4 });
        let a = client.embed(&["Hello  World".to_string()], true, 0).await.unwrap();
        let b = client.embed(&["hello world".to_string()], true, 0).await.unwrap();
        assert_eq!(a[0], b[0]);
    }

    #[test]
    fn pseudo_random_vector_is_deterministic_for_same_seed() {
        let a = pseudo_random_vector("same input", 16);
        let b = pseudo_random_vector("same input", 16);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn rate_limited_client_still_delegates_to_provider() {
        let client = RateLimitedEmbeddingClient::new(CachingEmbeddingClient::new(MockProvider { dimension: 4 }), 1000);
        let vectors = client.embed(&["hello".to_string()], true, 0).await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(client.dimension(), 4);
    }
}
