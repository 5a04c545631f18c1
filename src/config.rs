use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub case_source: CaseSourceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaseSourceConfig {
    pub base_url: String,
    /// API key for bearer auth. Falls back to the CASE_SOURCE_API_KEY
    /// environment variable when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_source_retries")]
    pub max_retries: u32,
}

fn default_source_timeout_secs() -> u64 {
    30
}
fn default_download_timeout_secs() -> u64 {
    300
}
fn default_source_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size_tokens")]
    pub chunk_size_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size_tokens: default_chunk_size_tokens(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

fn default_chunk_size_tokens() -> usize {
    512
}
fn default_overlap_tokens() -> usize {
    128
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// API key for the OpenAI provider. Falls back to the OPENAI_API_KEY
    /// environment variable when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            api_key: None,
            dims: default_dims(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "ollama".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct SyncConfig {
    #[serde(default = "default_max_concurrent_items")]
    pub max_concurrent_items: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_items: default_max_concurrent_items(),
        }
    }
}

fn default_max_concurrent_items() -> usize {
    4
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.chunk_size_tokens == 0 {
        anyhow::bail!("chunking.chunk_size_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.chunk_size_tokens {
        anyhow::bail!("chunking.overlap_tokens must be strictly less than chunk_size_tokens");
    }

    // Validate embedding
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified for provider '{}'",
            config.embedding.provider
        );
    }
    match config.embedding.provider.as_str() {
        "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai or ollama.",
            other
        ),
    }

    // Validate case source
    if config.case_source.base_url.trim().is_empty() {
        anyhow::bail!("case_source.base_url must not be empty");
    }

    // Validate sync
    if config.sync.max_concurrent_items == 0 {
        anyhow::bail!("sync.max_concurrent_items must be >= 1");
    }

    Ok(config)
}
