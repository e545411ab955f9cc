//! Configuration for extraction, retrieval and the external services

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Hard ceiling on refinement iterations per query
pub const MAX_REFINEMENT_ITERATIONS: usize = 3;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenseConfig {
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub services: ServiceConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub sheets: HashMap<String, SheetConfig>,
}

impl SenseConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: SenseConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        let ex = &self.extraction;
        if ex.sample_size == 0 || ex.sample_size > 5 {
            anyhow::bail!(
                "Configuration error: extraction.sample_size must be between 1 and 5, got {}",
                ex.sample_size
            );
        }
        if ex.type_sample_limit == 0 {
            anyhow::bail!("Configuration error: extraction.type_sample_limit must be positive");
        }
        if ex.min_column_rule_rows < 2 {
            anyhow::bail!(
                "Configuration error: extraction.min_column_rule_rows must be at least 2, got {}",
                ex.min_column_rule_rows
            );
        }

        let rt = &self.retrieval;
        if !(0.0..=1.0).contains(&rt.similarity_threshold) {
            anyhow::bail!(
                "Configuration error: retrieval.similarity_threshold must be within [0, 1], got {}",
                rt.similarity_threshold
            );
        }
        if rt.max_iterations == 0 || rt.max_iterations > MAX_REFINEMENT_ITERATIONS {
            anyhow::bail!(
                "Configuration error: retrieval.max_iterations must be between 1 and {}, got {}",
                MAX_REFINEMENT_ITERATIONS,
                rt.max_iterations
            );
        }
        if rt.top_k == 0 || rt.max_results == 0 {
            anyhow::bail!("Configuration error: retrieval.top_k and retrieval.max_results must be positive");
        }
        if rt.ambiguity_margin < 0.0 {
            anyhow::bail!("Configuration error: retrieval.ambiguity_margin must not be negative");
        }

        let rk = &self.ranking;
        for (name, value) in [
            ("exact_name_boost", rk.exact_name_boost),
            ("sheet_match_boost", rk.sheet_match_boost),
            ("verified_boost", rk.verified_boost),
        ] {
            if value < 0.0 {
                anyhow::bail!("Configuration error: ranking.{} must not be negative", name);
            }
        }

        if self.services.max_attempts == 0 {
            anyhow::bail!("Configuration error: services.max_attempts must be at least 1");
        }
        if self.embedding.dimension == 0 {
            anyhow::bail!("Configuration error: embedding.dimension must be positive");
        }

        Ok(())
    }

    /// Configuration for a given sheet, if any
    pub fn sheet(&self, sheet_name: &str) -> Option<&SheetConfig> {
        self.sheets.get(sheet_name)
    }

    /// Whether a sheet is excluded from extraction
    pub fn is_sheet_skipped(&self, sheet_name: &str) -> bool {
        self.sheet(sheet_name).is_some_and(|s| s.skip)
    }

    /// Configured description for a column, if any
    pub fn column_description(&self, sheet_name: &str, column: &str) -> Option<&str> {
        self.sheet(sheet_name)
            .and_then(|s| s.descriptions.get(column))
            .map(|d| d.as_str())
    }

    /// Retry policy shared by every external call
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.services.max_attempts,
            initial_backoff: Duration::from_millis(self.services.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.services.max_backoff_ms),
        }
    }
}

/// Extraction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Representative values kept per column (at most 5)
    pub sample_size: usize,
    /// Data cells examined for type inference per column
    pub type_sample_limit: usize,
    /// Consecutive rows needed before a repeated formula becomes a column rule
    pub min_column_rule_rows: usize,
    /// Functions whose results are non-deterministic
    pub volatile_functions: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            sample_size: 5,
            type_sample_limit: 200,
            min_column_rule_rows: 2,
            volatile_functions: [
                "NOW",
                "TODAY",
                "RAND",
                "RANDBETWEEN",
                "RANDARRAY",
                "OFFSET",
                "INDIRECT",
                "INFO",
                "CELL",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Agent loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Neighbours requested per search
    pub top_k: usize,
    /// Similarity at or above which a result counts as confident
    pub similarity_threshold: f32,
    /// Score gap under which two unrelated candidates are considered comparable
    pub ambiguity_margin: f32,
    /// Refinement iterations, capped at 3
    pub max_iterations: usize,
    /// Results returned to the caller
    pub max_results: usize,
    /// Live reads issued per iteration for factual queries
    pub max_live_reads: usize,
    /// Clarification rounds per session before proceeding on a best guess
    pub max_clarifications: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            similarity_threshold: 0.35,
            ambiguity_margin: 0.03,
            max_iterations: MAX_REFINEMENT_ITERATIONS,
            max_results: 5,
            max_live_reads: 3,
            max_clarifications: 2,
        }
    }
}

/// Contextual-fit adjustments applied on top of similarity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub exact_name_boost: f32,
    pub sheet_match_boost: f32,
    pub verified_boost: f32,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            exact_name_boost: 0.15,
            sheet_match_boost: 0.05,
            verified_boost: 0.1,
        }
    }
}

/// Timeouts and retries for external calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub timeout_seconds: u64,
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
        }
    }
}

/// Embedding provider selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `hashing` (local, deterministic) or `openai`
    pub provider: String,
    pub dimension: usize,
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            dimension: 512,
            model: "text-embedding-3-small".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

/// Reasoning provider selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    /// `heuristic` (local, deterministic) or `openai`
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub api_key_env: String,
    pub temperature: f32,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            provider: "heuristic".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.0,
        }
    }
}

/// Sheet-specific configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SheetConfig {
    /// Leave this sheet out of the indices
    #[serde(default)]
    pub skip: bool,
    /// Force the header row (1-based), bypassing detection
    #[serde(default)]
    pub header_row: Option<u32>,
    /// Column descriptions keyed by header label
    #[serde(default)]
    pub descriptions: HashMap<String, String>,
}
