//! TOML configuration.
//!
//! Every section is optional and falls back to the defaults below, so an
//! empty file (or [`Config::minimal`]) yields a working configuration.
//! Credentials are never read from the file: the vision model uses
//! `ANTHROPIC_API_KEY` and the embedding/chat models use `OPENAI_API_KEY`.
//!
//! ```toml
//! [vision]
//! model = "claude-3-5-sonnet-20241022"
//! dpi = 200
//!
//! [embedding]
//! model = "text-embedding-3-small"
//!
//! [chunking]
//! chunk_size = 800
//! chunk_overlap = 100
//!
//! [retrieval]
//! k = 6
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VisionConfig {
    #[serde(default = "default_vision_model")]
    pub model: String,
    #[serde(default = "default_anthropic_url")]
    pub url: String,
    /// Rasterization resolution for every page sent to the vision model.
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    #[serde(default = "default_vision_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_vision_max_tokens")]
    pub max_tokens: u32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            model: default_vision_model(),
            url: default_anthropic_url(),
            dpi: default_dpi(),
            timeout_secs: default_vision_timeout_secs(),
            max_tokens: default_vision_max_tokens(),
        }
    }
}

fn default_vision_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}
fn default_anthropic_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_dpi() -> u32 {
    200
}
fn default_vision_timeout_secs() -> u64 {
    60
}
fn default_vision_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_openai_url")]
    pub url: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            url: default_openai_url(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_openai_url() -> String {
    "https://api.openai.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_openai_url")]
    pub url: String,
    #[serde(default)]
    pub temperature: f32,
    /// Pause between words when a failed stream is replayed from a blocking answer.
    #[serde(default = "default_fallback_word_delay_ms")]
    pub fallback_word_delay_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: default_chat_model(),
            url: default_openai_url(),
            temperature: 0.0,
            fallback_word_delay_ms: default_fallback_word_delay_ms(),
        }
    }
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_fallback_word_delay_ms() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target passage size, in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters carried over from the tail of one passage to the next.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { k: default_k() }
    }
}

fn default_k() -> usize {
    6
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IndexingConfig {
    /// Drop and recreate a document's collection before re-indexing it.
    /// Off by default: re-analysis upserts in place over sequential ids.
    #[serde(default)]
    pub reset_on_reanalyze: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            upload_dir: default_upload_dir(),
            max_file_size: default_max_file_size(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}
fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}
fn default_allowed_extensions() -> Vec<String> {
    [".pdf", ".docx", ".jpg", ".jpeg", ".png"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    /// All defaults; used when no configuration file is present.
    pub fn minimal() -> Self {
        Self::default()
    }

    pub fn anthropic_api_key() -> Option<String> {
        non_empty_env(ANTHROPIC_API_KEY_ENV)
    }

    pub fn openai_api_key() -> Option<String> {
        non_empty_env(OPENAI_API_KEY_ENV)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            anyhow::bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            anyhow::bail!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.chunk_overlap,
                self.chunking.chunk_size
            );
        }
        if self.retrieval.k < 1 {
            anyhow::bail!("retrieval.k must be >= 1");
        }
        if !(36..=600).contains(&self.vision.dpi) {
            anyhow::bail!("vision.dpi must be in [36, 600]");
        }
        if !(0.0..=2.0).contains(&self.chat.temperature) {
            anyhow::bail!("chat.temperature must be in [0.0, 2.0]");
        }
        Ok(())
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.chunking.chunk_size, 800);
        assert_eq!(config.chunking.chunk_overlap, 100);
        assert_eq!(config.retrieval.k, 6);
        assert_eq!(config.vision.dpi, 200);
        assert_eq!(config.embedding.model, "text-embedding-3-small");
        assert!(!config.indexing.reset_on_reanalyze);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str("[chunking]\nchunk_size = 400\n").unwrap();
        assert_eq!(config.chunking.chunk_size, 400);
        assert_eq!(config.chunking.chunk_overlap, 100);
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let config: Config =
            toml::from_str("[chunking]\nchunk_size = 100\nchunk_overlap = 100\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn zero_k_rejected() {
        let config: Config = toml::from_str("[retrieval]\nk = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/medrag.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/medrag.toml"));
    }
}
