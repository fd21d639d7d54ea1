pub mod augment;
pub mod chat;
pub mod document_store;
pub mod embeddings;
pub mod index_manager;
pub mod persistence;
pub mod retriever;
pub mod vector_store;

use std::sync::Arc;
use std::time::Duration;

use crate::completion::{CompletionClient, HttpCompletionClient};
use crate::config::Settings;
use crate::error::Result;
use crate::indexer::extractor::{DocumentParser, FileParser};
use self::chat::ChatService;
use self::embeddings::{build_embedder, Embedder};
use self::index_manager::IndexManager;
use self::retriever::Retriever;
use self::vector_store::VectorIndex;

/// Owns one index and the services built around it. Separate engines never
/// share state.
pub struct RagEngine {
    settings: Settings,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    completion: Arc<dyn CompletionClient>,
    retriever: Retriever,
    chat: ChatService,
    manager: IndexManager,
}

impl RagEngine {
    /// Validate settings, load the embedding model and the completion
    /// client, then restore the index or start without one.
    pub async fn init(settings: Settings) -> Result<Self> {
        settings.validate()?;

        let embedding_settings = settings.embedding.clone();
        let embedder = tokio::task::spawn_blocking(move || build_embedder(&embedding_settings))
            .await
            .map_err(|e| {
                crate::error::RagError::Config(format!("Embedding model task failed: {}", e))
            })??;
        let completion: Arc<dyn CompletionClient> =
            Arc::new(HttpCompletionClient::new(&settings.completion)?);

        Self::with_components(settings, embedder, completion, Arc::new(FileParser)).await
    }

    /// Wire an engine from explicit collaborators.
    pub async fn with_components(
        settings: Settings,
        embedder: Arc<dyn Embedder>,
        completion: Arc<dyn CompletionClient>,
        parser: Arc<dyn DocumentParser>,
    ) -> Result<Self> {
        settings.validate()?;

        let index = Arc::new(
            VectorIndex::load_or_create(&settings.index.dir, embedder.model_id(), embedder.dimension())
                .await?,
        );

        let retriever = Retriever::new(
            Arc::clone(&index),
            Arc::clone(&embedder),
            Duration::from_secs(settings.embedding.timeout_secs),
        );
        let chat = ChatService::new(
            retriever.clone(),
            Arc::clone(&completion),
            settings.retrieval.top_k,
            settings.completion.temperature,
        );
        let manager = IndexManager::new(
            Arc::clone(&index),
            Arc::clone(&embedder),
            parser,
            &settings,
        )?;

        tracing::info!(
            "RAG engine ready (model {}, {} chunks indexed)",
            embedder.model_id(),
            index.len().await
        );

        Ok(Self {
            settings,
            index,
            embedder,
            completion,
            retriever,
            chat,
            manager,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn completion(&self) -> &Arc<dyn CompletionClient> {
        &self.completion
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn chat(&self) -> &ChatService {
        &self.chat
    }

    pub fn manager(&self) -> &IndexManager {
        &self.manager
    }

    /// Final persist.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down RAG engine");
        self.manager.persist().await
    }
}
