//! Language capability — text generation and embedding (`SPEC_FULL.md` §6).
//!
//! [`LanguageCapability`] is the sole surface the planner, synthesizer, and
//! registry use to talk to a model. Concrete implementations speak Ollama's
//! native API or an OpenAI-compatible chat-completions endpoint, which also
//! covers Anthropic's OpenAI-compatible surface and local servers such as
//! LM Studio. [`RateLimiter`] is shared across all callers so one slow
//! provider can't be hammered by concurrent pipeline nodes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::CapabilityConfig;

/// Errors from a language capability call.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    /// HTTP transport failure.
    #[error("capability request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Non-2xx response from the provider.
    #[error("capability provider returned {status}: {body}")]
    Provider {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
    /// Response body did not match the expected shape.
    #[error("capability response parse error: {0}")]
    Parse(String),
    /// The call did not complete within its deadline.
    #[error("capability call timed out after {seconds}s")]
    Timeout {
        /// Deadline budget in seconds.
        seconds: u64,
    },
    /// Unknown `provider` value in configuration.
    #[error("unknown capability provider: {0}")]
    UnknownProvider(String),
}

/// Generation and embedding interface (`SPEC_FULL.md` §6).
///
/// All implementations must be `Send + Sync` to allow shared use across
/// async task boundaries (the planner, synthesizer, and executor all hold
/// a `Arc<dyn LanguageCapability>`).
#[async_trait]
pub trait LanguageCapability: Send + Sync {
    /// Generate a completion from a system/user prompt pair, bounded by
    /// `deadline`.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is unreachable, returns a non-2xx
    /// response, or does not respond before `deadline` elapses.
    async fn generate(
        &self,
        system: &str,
        user: &str,
        deadline: Duration,
    ) -> Result<String, CapabilityError>;

    /// Generate an embedding vector for `text`.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is unreachable or the request fails.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError>;

    /// Dimensionality of vectors produced by [`LanguageCapability::embed`].
    fn embedding_dims(&self) -> usize;
}

/// Enforces a minimum gap between consecutive calls to a shared provider
/// (`SPEC_FULL.md` §5 default: 5s for free-tier endpoints).
///
/// A single instance is constructed at startup and shared via `Arc` across
/// every concurrent pipeline node, rather than a module-level timestamp, so
/// unrelated runs don't serialize on global mutable state they don't share.
#[derive(Debug)]
pub struct RateLimiter {
    last_call: Mutex<Instant>,
    min_gap: Duration,
}

impl RateLimiter {
    /// Create a rate limiter with the given minimum gap between calls.
    pub fn new(min_gap: Duration) -> Self {
        Self {
            last_call: Mutex::new(Instant::now() - min_gap),
            min_gap,
        }
    }

    /// Block until at least `min_gap` has elapsed since the previous call
    /// returned from this method.
    pub async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;
        let elapsed = last_call.elapsed();
        if elapsed < self.min_gap {
            tokio::time::sleep(self.min_gap - elapsed).await;
        }
        *last_call = Instant::now();
    }
}

/// A [`LanguageCapability`] wrapped with a shared [`RateLimiter`].
pub struct RateLimited<C> {
    inner: C,
    limiter: Arc<RateLimiter>,
}

impl<C> RateLimited<C> {
    /// Wrap `inner` with the given shared rate limiter.
    pub fn new(inner: C, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl<C: LanguageCapability> LanguageCapability for RateLimited<C> {
    async fn generate(
        &self,
        system: &str,
        user: &str,
        deadline: Duration,
    ) -> Result<String, CapabilityError> {
        self.limiter.wait().await;
        self.inner.generate(system, user, deadline).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        self.limiter.wait().await;
        self.inner.embed(text).await
    }

    fn embedding_dims(&self) -> usize {
        self.inner.embedding_dims()
    }
}

/// Build a [`LanguageCapability`] from configuration, wrapped in a shared
/// rate limiter.
///
/// # Errors
///
/// Returns an error if `config.provider` is not recognized.
pub fn build_capability(
    config: &CapabilityConfig,
) -> Result<Arc<dyn LanguageCapability>, CapabilityError> {
    let limiter = Arc::new(RateLimiter::new(Duration::from_secs(
        config.rate_limit_gap_secs,
    )));
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(RateLimited::new(
            OllamaCapability::new(&config.base_url, &config.model, config.embedding_dims),
            limiter,
        ))),
        "openai_compatible" => {
            let api_key = if config.api_key_env.is_empty() {
                None
            } else {
                std::env::var(&config.api_key_env).ok()
            };
            Ok(Arc::new(RateLimited::new(
                OpenAiCompatibleCapability::new(
                    &config.base_url,
                    &config.model,
                    &config.embedding_model,
                    config.embedding_dims,
                    api_key,
                ),
                limiter,
            )))
        }
        other => Err(CapabilityError::UnknownProvider(other.to_owned())),
    }
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

/// Native Ollama provider: `/api/generate` and `/api/embed`.
pub struct OllamaCapability {
    base_url: String,
    model: String,
    embedding_model: String,
    client: reqwest::Client,
    dims: usize,
}

impl OllamaCapability {
    /// Create an Ollama capability for the given generation model.
    ///
    /// The embedding model defaults to `nomic-embed-text`; use
    /// [`OllamaCapability::with_embedding_model`] to override it.
    pub fn new(base_url: &str, model: &str, dims: usize) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            model: model.to_owned(),
            embedding_model: "nomic-embed-text".to_owned(),
            client: reqwest::Client::new(),
            dims,
        }
    }

    /// Override the embedding model used by [`LanguageCapability::embed`].
    pub fn with_embedding_model(mut self, embedding_model: &str) -> Self {
        self.embedding_model = embedding_model.to_owned();
        self
    }
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    system: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl LanguageCapability for OllamaCapability {
    async fn generate(
        &self,
        system: &str,
        user: &str,
        deadline: Duration,
    ) -> Result<String, CapabilityError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerateRequest {
            model: &self.model,
            prompt: user.to_owned(),
            system,
            stream: false,
        };

        let response = timeout(deadline, self.client.post(&url).json(&body).send())
            .await
            .map_err(|_| CapabilityError::Timeout {
                seconds: deadline.as_secs(),
            })??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::Parse(e.to_string()))?;
        Ok(parsed.response)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        let url = format!("{}/api/embed", self.base_url);
        let body = OllamaEmbedRequest {
            model: &self.embedding_model,
            input: text,
        };

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::Parse(e.to_string()))?;
        parsed
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| CapabilityError::Parse("empty embeddings array".to_owned()))
    }

    fn embedding_dims(&self) -> usize {
        self.dims
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible (OpenAI, Anthropic's OpenAI-compatible surface, LM Studio)
// ---------------------------------------------------------------------------

/// Chat-completions provider speaking the OpenAI request/response shape.
///
/// Works against `https://api.openai.com`, Anthropic's OpenAI-compatible
/// endpoint, and any local server implementing the same contract.
pub struct OpenAiCompatibleCapability {
    base_url: String,
    model: String,
    embedding_model: String,
    api_key: Option<String>,
    client: reqwest::Client,
    dims: usize,
}

impl OpenAiCompatibleCapability {
    /// Create a provider for the given base URL and models.
    pub fn new(
        base_url: &str,
        model: &str,
        embedding_model: &str,
        dims: usize,
        api_key: Option<String>,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            model: model.to_owned(),
            embedding_model: embedding_model.to_owned(),
            api_key,
            client: reqwest::Client::new(),
            dims,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl LanguageCapability for OpenAiCompatibleCapability {
    async fn generate(
        &self,
        system: &str,
        user: &str,
        deadline: Duration,
    ) -> Result<String, CapabilityError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_owned(),
                },
                ChatMessage {
                    role: "user",
                    content: user.to_owned(),
                },
            ],
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = timeout(deadline, request.send())
            .await
            .map_err(|_| CapabilityError::Timeout {
                seconds: deadline.as_secs(),
            })??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::Parse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CapabilityError::Parse("empty choices array".to_owned()))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = EmbeddingRequest {
            model: &self.embedding_model,
            input: text,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::Parse(e.to_string()))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| CapabilityError::Parse("empty embedding data array".to_owned()))
    }

    fn embedding_dims(&self) -> usize {
        self.dims
    }
}

// ---------------------------------------------------------------------------
// Test fake
// ---------------------------------------------------------------------------

/// In-memory capability used by component tests — returns canned responses
/// without making HTTP calls.
#[cfg(test)]
pub struct MockCapability {
    /// Responses returned in order by successive `generate` calls.
    pub responses: Mutex<std::collections::VecDeque<String>>,
    /// Fixed embedding returned by `embed`.
    pub embedding: Vec<f32>,
}

#[cfg(test)]
impl MockCapability {
    /// Build a mock that returns `responses` in order, then repeats the last.
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            embedding: vec![0.1; 8],
        }
    }
}

#[cfg(test)]
#[async_trait]
impl LanguageCapability for MockCapability {
    async fn generate(
        &self,
        _system: &str,
        _user: &str,
        _deadline: Duration,
    ) -> Result<String, CapabilityError> {
        let mut queue = self.responses.lock().await;
        Ok(queue.pop_front().unwrap_or_default())
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, CapabilityError> {
        Ok(self.embedding.clone())
    }

    fn embedding_dims(&self) -> usize {
        self.embedding.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_enforces_minimum_gap() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        let start = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_mock_capability_returns_queued_responses() {
        let mock = MockCapability::new(vec!["first".to_owned(), "second".to_owned()]);
        let first = mock
            .generate("sys", "user", Duration::from_secs(1))
            .await
            .expect("first response");
        let second = mock
            .generate("sys", "user", Duration::from_secs(1))
            .await
            .expect("second response");
        assert_eq!(first, "first");
        assert_eq!(second, "second");
    }

    #[test]
    fn test_build_capability_rejects_unknown_provider() {
        let mut config = CapabilityConfig::default();
        config.provider = "bogus".to_owned();
        let result = build_capability(&config);
        assert!(matches!(result, Err(CapabilityError::UnknownProvider(_))));
    }
}
