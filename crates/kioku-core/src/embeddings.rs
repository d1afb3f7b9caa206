//! Embeddings
//!
//! Dense vectors over `trigger + " " + content` text. Vectors persist as
//! little-endian f32 blobs; similarity is exact cosine over all candidates
//! (the store is small enough that no ANN index is warranted).

use std::time::Duration;

use serde_json::json;

/// Default vector width (text-embedding-3-small)
pub const EMBEDDING_DIMENSIONS: usize = 1536;

/// Maximum text length sent to the provider (truncated if longer)
pub const MAX_TEXT_LENGTH: usize = 8000;

/// Embedding error types
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding provider unavailable: {0}")]
    Unavailable(String),
    #[error("Embedding request timed out")]
    Timeout,
    #[error("Invalid embedding response: {0}")]
    InvalidResponse(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

// ============================================================================
// EMBEDDING TYPE
// ============================================================================

/// A dense embedding vector
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
}

impl Embedding {
    pub fn new(vector: Vec<f32>) -> Self {
        Self { vector }
    }

    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }

    /// Serialize as little-endian f32 bytes for BLOB storage
    pub fn to_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Restore from BLOB bytes. Returns `None` when the length is not a
    /// multiple of four.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let vector = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(Self::new(vector))
    }
}

/// Cosine similarity between two vectors. Mismatched lengths or an all-zero
/// vector yield 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 {
        dot / denominator
    } else {
        0.0
    }
}

/// L2-normalize a vector in place; an all-zero vector is left unchanged
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// A provider that turns text into fixed-width vectors
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Vector width
    fn dimensions(&self) -> usize;

    /// Embed a single text
    fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError>;

    /// Embed a batch; default implementation loops over `embed`
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

// ============================================================================
// OPENAI-COMPATIBLE PROVIDER
// ============================================================================

/// OpenAI-compatible `/v1/embeddings` client (blocking, 30 s timeout)
pub struct OpenAiEmbedding {
    client: reqwest::blocking::Client,
    embeddings_url: String,
    auth_header: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAiEmbedding {
    pub fn new(base_url: &str, api_key: &str, model: &str, dims: usize) -> Self {
        let base = base_url.trim_end_matches('/');
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self {
            client,
            embeddings_url: format!("{base}/v1/embeddings"),
            auth_header: format!("Bearer {api_key}"),
            model: model.to_string(),
            dims,
            max_retries: 3,
        }
    }

    /// Build from config sections, reading the key from `OPENAI_API_KEY`
    pub fn from_config(config: &crate::config::EmbeddingConfig) -> Self {
        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        let base = config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com");
        Self::new(base, &api_key, &config.model, config.dimensions)
    }

    fn request(&self, input: serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = json!({ "model": self.model, "input": input });

        let mut last_err = EmbeddingError::Unavailable("no attempt made".to_string());
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                std::thread::sleep(Duration::from_millis(1000 * u64::from(attempt)));
                tracing::warn!("retrying embedding request (attempt {})", attempt + 1);
            }

            let response = match self
                .client
                .post(&self.embeddings_url)
                .header("Authorization", &self.auth_header)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
            {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    last_err = EmbeddingError::Timeout;
                    continue;
                }
                Err(e) => {
                    last_err = EmbeddingError::Unavailable(e.to_string());
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                last_err = EmbeddingError::Unavailable(format!("embedding API error {status}"));
                continue;
            }
            if !status.is_success() {
                return Err(EmbeddingError::Unavailable(format!(
                    "embedding API error {status}"
                )));
            }

            let payload: serde_json::Value = response
                .json()
                .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
            return parse_embedding_payload(&payload);
        }

        Err(last_err)
    }
}

fn parse_embedding_payload(payload: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = payload
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing 'data'".to_string()))?;

    // The API preserves input order; sort by index anyway
    let mut indexed: Vec<(i64, Vec<f32>)> = Vec::with_capacity(data.len());
    for item in data {
        let index = item.get("index").and_then(|i| i.as_i64()).unwrap_or(0);
        let vector = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbeddingError::InvalidResponse("missing 'embedding'".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn truncate(text: &str) -> &str {
    if text.len() <= MAX_TEXT_LENGTH {
        return text;
    }
    let mut end = MAX_TEXT_LENGTH;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

impl EmbeddingProvider for OpenAiEmbedding {
    fn name(&self) -> &str {
        "openai"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("text cannot be empty".to_string()));
        }
        let vectors = self.request(json!(truncate(text)))?;
        vectors
            .into_iter()
            .next()
            .map(Embedding::new)
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty data".to_string()))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let truncated: Vec<&str> = texts.iter().map(|t| truncate(t)).collect();
        let vectors = self.request(json!(truncated))?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors.into_iter().map(Embedding::new).collect())
    }
}

// ============================================================================
// DETERMINISTIC PROVIDER (tests / offline smoke runs)
// ============================================================================

/// Hash-seeded embedder: identical text maps to identical vectors, distinct
/// text to near-orthogonal ones. No network, no model download.
pub struct DeterministicEmbedding {
    dims: usize,
    seed: u64,
}

impl DeterministicEmbedding {
    pub fn new(dims: usize) -> Self {
        Self { dims, seed: 0 }
    }

    pub fn with_seed(dims: usize, seed: u64) -> Self {
        Self { dims, seed }
    }

    fn fnv1a64(seed: u64, bytes: &[u8]) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ seed;
        for &b in bytes {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        hash
    }

    fn splitmix64(x: u64) -> u64 {
        let mut z = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    fn u64_to_unit_f32(x: u64) -> f32 {
        const U24_MAX: f32 = ((1u32 << 24) - 1) as f32;
        let top_u24 = (x >> 40) as u32;
        (top_u24 as f32 / U24_MAX) * 2.0 - 1.0
    }
}

impl EmbeddingProvider for DeterministicEmbedding {
    fn name(&self) -> &str {
        "deterministic"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let base = Self::fnv1a64(self.seed, text.as_bytes());
        let mut vector = Vec::with_capacity(self.dims);
        for i in 0..self.dims {
            let mixed = Self::splitmix64(base ^ (i as u64));
            vector.push(Self::u64_to_unit_f32(mixed));
        }
        Ok(Embedding::new(vector))
    }
}

// ============================================================================
// TESTS
// ============================================================================
