use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Mutex;

use super::document_store::Document;
use super::embeddings::{embed_with_timeout, Embedder};
use super::vector_store::{DuplicatePolicy, NewChunk, VectorIndex};
use crate::config::Settings;
use crate::error::{RagError, Result};
use crate::indexer::chunker::Chunker;
use crate::indexer::extractor::DocumentParser;
use crate::models::{FailedFile, IndexStatus, IngestedFile, UploadResponse};

const EMBED_BATCH_SIZE: usize = 32;

/// Parse → chunk → embed → index, with status tracking.
pub struct IndexManager {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    parser: Arc<dyn DocumentParser>,
    chunker: Chunker,
    index_dir: PathBuf,
    persist_on_write: bool,
    duplicate_policy: DuplicatePolicy,
    embed_timeout: Duration,
    status: Mutex<IndexStatus>,
}

impl IndexManager {
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        parser: Arc<dyn DocumentParser>,
        settings: &Settings,
    ) -> Result<Self> {
        if embedder.dimension() != index.dimension() {
            return Err(RagError::Config(format!(
                "Embedder dimension {} does not match index dimension {}",
                embedder.dimension(),
                index.dimension()
            )));
        }

        Ok(Self {
            index,
            embedder,
            parser,
            chunker: Chunker::from_settings(&settings.chunking)?,
            index_dir: settings.index.dir.clone(),
            persist_on_write: settings.index.persist_on_write,
            duplicate_policy: settings.index.duplicate_policy,
            embed_timeout: Duration::from_secs(settings.embedding.timeout_secs),
            status: Mutex::new(IndexStatus::default()),
        })
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub async fn status(&self) -> IndexStatus {
        let mut status = self.status.lock().await.clone();
        status.index_built = self.index.is_built().await;
        let counts = self.index.filenames().await;
        status.total_files = counts.len();
        status.total_chunks = counts.values().sum();
        status
    }

    pub async fn is_indexing(&self) -> bool {
        self.status.lock().await.is_indexing
    }

    /// Index one uploaded file.
    pub async fn ingest(&self, filename: &str, bytes: Vec<u8>) -> Result<IngestedFile> {
        let result = self.ingest_one(filename, bytes).await;
        let mut status = self.status.lock().await;
        match &result {
            Ok(_) => {
                status.last_indexed_at = Some(Utc::now());
                status.last_error = None;
            }
            Err(e) => status.last_error = Some(format!("{}: {}", filename, e)),
        }
        drop(status);

        let ingested = result?;
        if ingested.chunks + ingested.replaced > 0 {
            self.persist_after_write().await;
        }
        Ok(ingested)
    }

    /// Index several files. A failing file is reported and the rest still
    /// go through; the index is persisted once at the end.
    pub async fn ingest_batch(&self, files: Vec<(String, Vec<u8>)>) -> Result<UploadResponse> {
        {
            let mut status = self.status.lock().await;
            if status.is_indexing {
                return Err(RagError::InvalidRequest(
                    "Indexing already in progress".to_string(),
                ));
            }
            status.is_indexing = true;
            status.last_error = None;
            status.failed_files.clear();
        }

        // Catch panics so is_indexing always resets
        let result = std::panic::AssertUnwindSafe(self.run_batch(files))
            .catch_unwind()
            .await;

        let mut status = self.status.lock().await;
        status.is_indexing = false;
        let report = match result {
            Ok(report) => report,
            Err(panic_info) => {
                let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    format!("Indexing panicked: {}", s)
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    format!("Indexing panicked: {}", s)
                } else {
                    "Indexing panicked with unknown error".to_string()
                };
                tracing::error!("{}", panic_msg);
                status.last_error = Some(panic_msg.clone());
                return Err(RagError::Storage(panic_msg));
            }
        };

        status.last_indexed_at = Some(Utc::now());
        status.failed_files = report.failed.iter().map(|f| f.filename.clone()).collect();
        if let Some(first) = report.failed.first() {
            status.last_error = Some(format!("{}: {}", first.filename, first.error));
        }
        drop(status);

        if report.indexed.iter().any(|f| f.chunks + f.replaced > 0) {
            self.persist_after_write().await;
        }

        tracing::info!(
            "Batch complete: {} indexed, {} failed",
            report.indexed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn run_batch(&self, files: Vec<(String, Vec<u8>)>) -> UploadResponse {
        let mut report = UploadResponse::default();
        for (filename, bytes) in files {
            match self.ingest_one(&filename, bytes).await {
                Ok(ingested) => report.indexed.push(ingested),
                Err(e) => {
                    tracing::warn!("Failed to index {}: {}", filename, e);
                    report.failed.push(FailedFile {
                        filename,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn ingest_one(&self, filename: &str, bytes: Vec<u8>) -> Result<IngestedFile> {
        let text = {
            let parser = Arc::clone(&self.parser);
            let name = filename.to_string();
            tokio::task::spawn_blocking(move || parser.parse_file(&name, &bytes))
                .await
                .map_err(|e| RagError::unsupported(filename, format!("parser task failed: {}", e)))??
        };

        let document = Document::new(filename, text);
        if document.raw_text.trim().is_empty() {
            tracing::warn!("{} contains no text; skipping", filename);
            return Ok(IngestedFile {
                filename: filename.to_string(),
                chunks: 0,
                replaced: 0,
            });
        }

        let chunks = self.chunker.chunk(&document.raw_text);
        let mut entries = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = embed_with_timeout(&self.embedder, texts, self.embed_timeout).await?;
            if vectors.len() != batch.len() {
                return Err(RagError::BackendError(format!(
                    "Embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                )));
            }

            for (chunk, vector) in batch.iter().zip(vectors) {
                entries.push(NewChunk {
                    chunk_id: document.chunk_id(chunk.chunk_index),
                    vector,
                    text: chunk.text.clone(),
                    filename: document.source_filename.clone(),
                    position: chunk.chunk_index + 1,
                });
            }
        }

        let outcome = self
            .index
            .add_file(filename, entries, self.duplicate_policy)
            .await?;

        Ok(IngestedFile {
            filename: filename.to_string(),
            chunks: outcome.added,
            replaced: outcome.replaced,
        })
    }

    /// Drop every chunk of `filename`.
    pub async fn remove(&self, filename: &str) -> Result<usize> {
        let removed = self.index.remove_by_filename(filename).await?;
        if removed > 0 {
            self.persist_after_write().await;
        }
        Ok(removed)
    }

    /// The in-memory change is already published, so a failed write is
    /// recorded in the status instead of failing the call.
    async fn persist_after_write(&self) {
        if !self.persist_on_write {
            return;
        }
        if let Err(e) = self.persist().await {
            tracing::error!("Index changed in memory but was not persisted: {}", e);
            self.status.lock().await.last_error = Some(format!("Persist failed: {}", e));
        }
    }

    pub async fn persist(&self) -> Result<()> {
        self.index.persist(&self.index_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingProviderKind;
    use crate::indexer::extractor::FileParser;
    use crate::rag::embeddings::HashEmbedder;

    fn settings(dir: &Path, policy: DuplicatePolicy) -> Settings {
        let mut settings = Settings::default();
        settings.embedding.provider = EmbeddingProviderKind::Hash;
        settings.embedding.model_id = "hash".to_string();
        settings.embedding.dimension = 32;
        settings.chunking.max_size = 40;
        settings.chunking.overlap = 10;
        settings.index.dir = dir.to_path_buf();
        settings.index.duplicate_policy = policy;
        settings
    }

    fn manager(dir: &Path, policy: DuplicatePolicy) -> IndexManager {
        IndexManager::new(
            Arc::new(VectorIndex::new("hash", 32)),
            Arc::new(HashEmbedder::new("hash", 32)),
            Arc::new(FileParser),
            &settings(dir, policy),
        )
        .unwrap()
    }

    const TEXT: &str = "Solar panels need cleaning twice a year. \
                        Inverters should be checked every spring. \
                        Batteries last about ten years.";

    #[tokio::test]
    async fn ingest_chunks_embeds_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), DuplicatePolicy::Reject);

        let ingested = manager.ingest("solar.txt", TEXT.as_bytes().to_vec()).await.unwrap();
        assert!(ingested.chunks > 1);

        let snapshot = manager.index().snapshot().await.unwrap();
        let mut positions: Vec<usize> = snapshot
            .documents()
            .iter()
            .map(|(_, record)| record.position)
            .collect();
        positions.sort();
        assert_eq!(positions, (1..=ingested.chunks).collect::<Vec<_>>());

        assert!(dir.path().join("vectors.json").exists());
        assert!(dir.path().join("metadata.json").exists());

        let status = manager.status().await;
        assert_eq!(status.total_files, 1);
        assert_eq!(status.total_chunks, ingested.chunks);
        assert!(status.index_built);
        assert!(status.last_indexed_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_policy_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let rejecting = manager(dir.path(), DuplicatePolicy::Reject);
        rejecting.ingest("a.txt", TEXT.as_bytes().to_vec()).await.unwrap();
        let result = rejecting.ingest("a.txt", b"new text".to_vec()).await;
        assert!(matches!(result, Err(RagError::DuplicateDocument(_))));

        let replacing = manager(dir.path(), DuplicatePolicy::Replace);
        let first = replacing.ingest("a.txt", TEXT.as_bytes().to_vec()).await.unwrap();
        let second = replacing.ingest("a.txt", b"new text".to_vec()).await.unwrap();
        assert_eq!(second.replaced, first.chunks);
        assert_eq!(second.chunks, 1);
        assert_eq!(replacing.index().filenames().await.get("a.txt"), Some(&1));
    }

    #[tokio::test]
    async fn blank_documents_are_reported_with_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), DuplicatePolicy::Reject);
        let ingested = manager.ingest("empty.md", b"  \n ".to_vec()).await.unwrap();
        assert_eq!(ingested.chunks, 0);
        assert!(!manager.index().is_built().await);
    }

    #[tokio::test]
    async fn batch_collects_failures_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), DuplicatePolicy::Reject);

        let report = manager
            .ingest_batch(vec![
                ("a.txt".to_string(), TEXT.as_bytes().to_vec()),
                ("b.exe".to_string(), vec![0, 1, 2]),
                ("c.md".to_string(), b"# Notes\n\nShort note.".to_vec()),
            ])
            .await
            .unwrap();

        assert_eq!(report.indexed.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].filename, "b.exe");

        let status = manager.status().await;
        assert!(!status.is_indexing);
        assert_eq!(status.failed_files, vec!["b.exe".to_string()]);
        assert_eq!(status.total_files, 2);
    }

    #[tokio::test]
    async fn remove_drops_file_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), DuplicatePolicy::Reject);
        manager.ingest("a.txt", TEXT.as_bytes().to_vec()).await.unwrap();
        manager.ingest("b.txt", b"Other content entirely.".to_vec()).await.unwrap();

        assert!(manager.remove("a.txt").await.unwrap() > 0);
        assert_eq!(manager.remove("a.txt").await.unwrap(), 0);

        let restored = VectorIndex::restore(dir.path(), "hash", 32).await.unwrap().unwrap();
        let files = restored.filenames().await;
        assert!(!files.contains_key("a.txt"));
        assert!(files.contains_key("b.txt"));
    }

    #[tokio::test]
    async fn persist_failure_keeps_the_ingest_result() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("not-a-dir");
        std::fs::write(&blocked, b"file in the way").unwrap();
        let manager = manager(&blocked, DuplicatePolicy::Reject);

        let ingested = manager.ingest("a.txt", TEXT.as_bytes().to_vec()).await.unwrap();
        assert!(ingested.chunks > 0);
        assert!(manager.index().contains_file("a.txt").await);

        let status = manager.status().await;
        assert!(status
            .last_error
            .as_deref()
            .is_some_and(|e| e.starts_with("Persist failed")));

        assert!(manager.remove("a.txt").await.unwrap() > 0);
        assert!(!manager.index().contains_file("a.txt").await);
    }

    #[tokio::test]
    async fn rejects_mismatched_embedder() {
        let dir = tempfile::tempdir().unwrap();
        let result = IndexManager::new(
            Arc::new(VectorIndex::new("hash", 16)),
            Arc::new(HashEmbedder::new("hash", 32)),
            Arc::new(FileParser),
            &settings(dir.path(), DuplicatePolicy::Reject),
        );
        assert!(matches!(result, Err(RagError::Config(_))));
    }
}
