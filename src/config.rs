//! TOML configuration parsing and validation.
//!
//! Every section except `[db]` is optional; omitted fields fall back to the
//! defaults below. `load_config` rejects combinations that would only fail
//! later (an enabled embedding provider without dims, a zero batch limit).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub classify: ClassifyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Text-generation endpoint and model selection.
#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    #[serde(default = "default_inference_url")]
    pub url: String,
    #[serde(default = "default_primary_model")]
    pub primary_model: String,
    #[serde(default = "default_backup_model")]
    pub backup_model: String,
    /// Per-request timeout. Local models can be slow, keep this generous.
    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            url: default_inference_url(),
            primary_model: default_primary_model(),
            backup_model: default_backup_model(),
            timeout_secs: default_inference_timeout(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_inference_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_primary_model() -> String {
    "mistral:7b".to_string()
}
fn default_backup_model() -> String {
    "phi3:mini".to_string()
}
fn default_inference_timeout() -> u64 {
    300
}
fn default_max_concurrent() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the `ollama` provider; defaults to `[inference].url`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Vector collection settings.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_collection")]
    pub collection: String,
    /// SQLite file for vectors; in-memory when omitted.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// How many entries `stats` samples for its histograms.
    #[serde(default = "default_stats_sample")]
    pub stats_sample: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            path: None,
            stats_sample: default_stats_sample(),
        }
    }
}

fn default_collection() -> String {
    "jobtrail_emails".to_string()
}
fn default_stats_sample() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifyConfig {
    /// Email text beyond this many characters is not sent to the model.
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
    /// Emails per background classification batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            max_content_chars: default_max_content_chars(),
            summary_max_chars: default_summary_max_chars(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_max_content_chars() -> usize {
    2000
}
fn default_summary_max_chars() -> usize {
    200
}
fn default_batch_size() -> usize {
    10
}

impl Config {
    /// In-memory index, embeddings disabled, database under `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            inference: InferenceConfig::default(),
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            classify: ClassifyConfig::default(),
        }
    }

    /// URL the `ollama` embedding provider talks to.
    pub fn embedding_url(&self) -> &str {
        self.embedding
            .url
            .as_deref()
            .unwrap_or(self.inference.url.as_str())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.inference.max_concurrent == 0 {
        anyhow::bail!("inference.max_concurrent must be >= 1");
    }
    if config.inference.primary_model.trim().is_empty() {
        anyhow::bail!("inference.primary_model must not be empty");
    }

    if config.index.stats_sample == 0 {
        anyhow::bail!("index.stats_sample must be >= 1");
    }
    if config.index.collection.trim().is_empty() {
        anyhow::bail!("index.collection must not be empty");
    }

    if config.classify.max_content_chars == 0 {
        anyhow::bail!("classify.max_content_chars must be > 0");
    }
    if config.classify.batch_size == 0 {
        anyhow::bail!("classify.batch_size must be >= 1");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "ollama" | "openai" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, ollama, openai, or local.",
            other
        ),
    }

    Ok(())
}
