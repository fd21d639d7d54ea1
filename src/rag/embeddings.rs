use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fastembed::{
    InitOptions, InitOptionsUserDefined, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
};
use sha2::{Digest, Sha256};

use crate::config::{EmbeddingProviderKind, EmbeddingSettings};
use crate::error::{RagError, Result};

const PROBE_TEXT: &str = "dimension probe";

/// Text → fixed-dimension vector. One instance serves one model for the
/// lifetime of an index.
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::BackendError("Embedder returned no vector".to_string()))
    }
}

pub struct EmbeddingGenerator {
    model: TextEmbedding,
    model_id: String,
    dimension: usize,
}

impl EmbeddingGenerator {
    /// Load the model. Any failure here is fatal for startup.
    pub fn new(settings: &EmbeddingSettings) -> Result<Self> {
        let model = match &settings.model_dir {
            Some(dir) => Self::load_user_defined(dir)?,
            None => Self::load_named(settings)?,
        };

        let generator = Self {
            model,
            model_id: settings.model_id.clone(),
            dimension: settings.dimension,
        };

        let probe = generator
            .model
            .embed(vec![PROBE_TEXT], None)
            .map_err(|e| RagError::Config(format!("Embedding model probe failed: {}", e)))?;
        let actual = probe.first().map_or(0, Vec::len);
        if actual != settings.dimension {
            return Err(RagError::Config(format!(
                "Model {} produces {}-dimensional vectors, configured dimension is {}",
                settings.model_id, actual, settings.dimension
            )));
        }

        tracing::info!(
            "Embedding model {} initialized ({} dimensions)",
            settings.model_id,
            settings.dimension
        );
        Ok(generator)
    }

    fn load_user_defined(model_dir: &Path) -> Result<TextEmbedding> {
        tracing::info!("Initializing embedding model from {}", model_dir.display());

        if !model_dir.exists() {
            return Err(RagError::Config(format!(
                "Model directory not found: {}",
                model_dir.display()
            )));
        }

        let read = |name: &str| {
            std::fs::read(model_dir.join(name))
                .map_err(|e| RagError::Config(format!("Failed to read {}: {}", name, e)))
        };

        let user_model = UserDefinedEmbeddingModel {
            onnx_file: read("model.onnx")?,
            tokenizer_files: TokenizerFiles {
                tokenizer_file: read("tokenizer.json")?,
                config_file: read("config.json")?,
                special_tokens_map_file: read("special_tokens_map.json")?,
                tokenizer_config_file: read("tokenizer_config.json")?,
            },
        };

        TextEmbedding::try_new_from_user_defined(user_model, InitOptionsUserDefined::default())
            .map_err(|e| RagError::Config(format!("Failed to initialize embedding model: {}", e)))
    }

    fn load_named(settings: &EmbeddingSettings) -> Result<TextEmbedding> {
        let info = TextEmbedding::list_supported_models()
            .into_iter()
            .find(|info| info.model_code == settings.model_id)
            .ok_or_else(|| {
                RagError::Config(format!("Unsupported embedding model: {}", settings.model_id))
            })?;

        tracing::info!(
            "Initializing embedding model {} (cache: {})",
            settings.model_id,
            settings.cache_dir.display()
        );

        TextEmbedding::try_new(InitOptions {
            model_name: info.model,
            cache_dir: settings.cache_dir.clone(),
            show_download_progress: false,
            ..Default::default()
        })
        .map_err(|e| RagError::Config(format!("Failed to initialize embedding model: {}", e)))
    }
}

impl Embedder for EmbeddingGenerator {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.model
            .embed(texts.to_vec(), None)
            .map_err(|e| RagError::BackendError(format!("Embedding failed: {}", e)))
    }
}

/// Signed feature hashing of lower-cased word tokens, L2-normalised.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    model_id: String,
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(model_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dimension,
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

pub fn build_embedder(settings: &EmbeddingSettings) -> Result<Arc<dyn Embedder>> {
    match settings.provider {
        EmbeddingProviderKind::FastEmbed => Ok(Arc::new(EmbeddingGenerator::new(settings)?)),
        EmbeddingProviderKind::Hash => {
            tracing::info!("Using hash embedder ({} dimensions)", settings.dimension);
            Ok(Arc::new(HashEmbedder::new(
                settings.model_id.clone(),
                settings.dimension,
            )))
        }
    }
}

/// Run an embedding call on the blocking pool. Exceeding `timeout` is
/// reported as the provider being unavailable.
pub async fn embed_with_timeout(
    embedder: &Arc<dyn Embedder>,
    texts: Vec<String>,
    timeout: Duration,
) -> Result<Vec<Vec<f32>>> {
    let embedder = Arc::clone(embedder);
    let task = tokio::task::spawn_blocking(move || embedder.embed(&texts));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(RagError::BackendError(format!(
            "Embedding task failed: {}",
            join_error
        ))),
        Err(_) => Err(RagError::BackendUnavailable(format!(
            "Embedding timed out after {:?}",
            timeout
        ))),
    }
}
