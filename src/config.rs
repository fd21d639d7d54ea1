use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::indexer::chunker::SizeUnit;
use crate::rag::vector_store::DuplicatePolicy;

/// Prefix for environment overrides, e.g. `RAG__INDEX__DIR=/var/lib/rag`.
pub const ENV_PREFIX: &str = "RAG";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    #[serde(default)]
    pub chunking: ChunkingSettings,
    #[serde(default)]
    pub index: IndexSettings,
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    #[serde(default)]
    pub completion: CompletionSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Local ONNX model through fastembed.
    FastEmbed,
    /// Feature-hashing embedder, no model files needed.
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingProviderKind,
    pub model_id: String,
    pub dimension: usize,
    /// Directory holding `model.onnx` and tokenizer files. When unset the
    /// named model is fetched into `cache_dir`.
    pub model_dir: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub timeout_secs: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::FastEmbed,
            model_id: "Qdrant/all-MiniLM-L6-v2-onnx".to_string(),
            dimension: 384,
            model_dir: None,
            cache_dir: PathBuf::from("./fastembed_cache"),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingSettings {
    pub max_size: usize,
    pub overlap: usize,
    pub unit: SizeUnit,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            max_size: 1000,
            overlap: 200,
            unit: SizeUnit::Chars,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexSettings {
    pub dir: PathBuf,
    pub persist_on_write: bool,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("db/index"),
            persist_on_write: true,
            duplicate_policy: DuplicatePolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompletionSettings {
    /// OpenAI-compatible base URL; `/chat/completions` is appended.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234/v1".to_string(),
            model: "qwen2.5-coder-7b-instruct".to_string(),
            api_key: None,
            temperature: 0.7,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub max_upload_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl Settings {
    /// Layer an optional settings file under `RAG__*` environment variables,
    /// then validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let raw = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| RagError::Config(e.to_string()))?;

        let settings: Settings = raw
            .try_deserialize()
            .map_err(|e| RagError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(source: &str) -> Result<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()
            .and_then(|raw| raw.try_deserialize::<Settings>())
            .map_err(|e| RagError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let embedding = &self.embedding;
        if embedding.model_id.trim().is_empty() {
            return Err(RagError::Config("embedding.model_id cannot be empty".to_string()));
        }
        if embedding.dimension == 0 {
            return Err(RagError::Config("embedding.dimension must be positive".to_string()));
        }
        if embedding.timeout_secs == 0 {
            return Err(RagError::Config("embedding.timeout_secs must be positive".to_string()));
        }

        let chunking = &self.chunking;
        if chunking.max_size == 0 {
            return Err(RagError::Config("chunking.max_size must be positive".to_string()));
        }
        if chunking.overlap >= chunking.max_size {
            return Err(RagError::Config(format!(
                "chunking.overlap ({}) must be smaller than chunking.max_size ({})",
                chunking.overlap, chunking.max_size
            )));
        }

        if self.retrieval.top_k == 0 {
            return Err(RagError::Config("retrieval.top_k must be positive".to_string()));
        }

        let completion = &self.completion;
        reqwest::Url::parse(&completion.base_url).map_err(|e| {
            RagError::Config(format!("Invalid completion.base_url {}: {}", completion.base_url, e))
        })?;
        if completion.model.trim().is_empty() {
            return Err(RagError::Config("completion.model cannot be empty".to_string()));
        }
        if !(0.0..=2.0).contains(&completion.temperature) {
            return Err(RagError::Config(format!(
                "completion.temperature {} must be within 0.0..=2.0",
                completion.temperature
            )));
        }
        if completion.timeout_secs == 0 {
            return Err(RagError::Config("completion.timeout_secs must be positive".to_string()));
        }

        Ok(())
    }
}
