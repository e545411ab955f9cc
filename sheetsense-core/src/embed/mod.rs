//! Text embedding providers

#[cfg(feature = "remote-services")]
pub mod openai;

use crate::config::SenseConfig;
use crate::error::ServiceError;
use anyhow::Result;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

/// Turns text into a fixed-dimension vector.
///
/// Implementations must be deterministic for identical text within a session.
pub trait Embedder: Send + Sync {
    /// Provider name, used in logs and error messages
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError>;
}

/// Build the embedder selected in the configuration
pub fn build_embedder(config: &SenseConfig) -> Result<Arc<dyn Embedder>> {
    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(embedding.dimension))),
        #[cfg(feature = "remote-services")]
        "openai" => {
            let api_key = std::env::var(&embedding.api_key_env).map_err(|_| {
                anyhow::anyhow!(
                    "embedding provider 'openai' needs the {} environment variable",
                    embedding.api_key_env
                )
            })?;
            Ok(Arc::new(openai::OpenAiEmbedder::new(
                &api_key,
                &embedding.base_url,
                &embedding.model,
                embedding.dimension,
                config.services.timeout(),
            )?))
        }
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "by", "does", "do", "for", "from", "how",
        "in", "is", "it", "of", "on", "or", "the", "this", "to", "was", "what", "when", "where",
        "which", "who", "why", "with", "me", "show", "tell", "get", "give", "i", "my", "our",
        "we", "you", "there", "their", "its", "into", "than", "then", "about", "can", "could",
        "would", "should", "please", "value", "values",
    ]
    .into_iter()
    .collect()
});

/// Lowercased content words: snake_case and CamelCase are split, stop words dropped
pub fn terms(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    let push = |current: &mut String, out: &mut Vec<String>| {
        if !current.is_empty() {
            let word = std::mem::take(current);
            if !STOP_WORDS.contains(word.as_str()) {
                out.push(word);
            }
        }
    };

    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if ch.is_uppercase() && prev_lower {
                push(&mut current, &mut out);
            }
            current.extend(ch.to_lowercase());
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        } else {
            push(&mut current, &mut out);
            prev_lower = false;
        }
    }
    push(&mut current, &mut out);
    out
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Deterministic local embedder based on signed feature hashing.
///
/// Features are content words plus character trigrams of each word, so
/// `margin` and `margins` still land close together.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn add(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a64(feature.as_bytes());
        let index = (hash % self.dimension as u64) as usize;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(512)
    }
}

impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in terms(text) {
            self.add(&mut vector, &format!("w:{}", word), 1.0);
            let padded: Vec<char> = format!("^{}$", word).chars().collect();
            for window in padded.windows(3) {
                let trigram: String = window.iter().collect();
                self.add(&mut vector, &format!("t:{}", trigram), 0.35);
            }
        }
        normalize(&mut vector);
        Ok(vector)
    }
}

/// Scale to unit length; zero vectors stay zero
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity; 0.0 for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        0.0
    } else {
        (dot / denom) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terms_split_identifiers() {
        assert_eq!(
            terms("How is gross_margin calculated from CostOfGoods?"),
            vec!["gross", "margin", "calculated", "cost", "goods"]
        );
    }

    #[test]
    fn test_hashing_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("gross margin").unwrap();
        let b = embedder.embed("gross margin").unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_related_text_scores_higher() {
        let embedder = HashingEmbedder::default();
        let query = embedder.embed("gross margin").unwrap();
        let close = embedder.embed("Gross Margin | sheet Income | gross_margin = (revenue - cost) / revenue").unwrap();
        let far = embedder.embed("column Region | sheet Sales | type text").unwrap();
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_empty_text_embeds_to_zero() {
        let embedder = HashingEmbedder::new(16);
        let v = embedder.embed("the of and").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
        assert_eq!(cosine_similarity(&v, &v), 0.0);
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let mut config = SenseConfig::default();
        config.embedding.provider = "mystery".into();
        assert!(build_embedder(&config).is_err());
    }
}
