use std::sync::Arc;
use std::time::Duration;

use super::embeddings::{embed_with_timeout, Embedder};
use super::vector_store::VectorIndex;
use crate::error::{RagError, Result};
use crate::models::RetrievalResult;

/// Embeds a query and looks it up in the shared index.
#[derive(Clone)]
pub struct Retriever {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    timeout: Duration,
}

impl Retriever {
    pub fn new(index: Arc<VectorIndex>, embedder: Arc<dyn Embedder>, timeout: Duration) -> Self {
        Self {
            index,
            embedder,
            timeout,
        }
    }

    /// Up to `k` chunks closest to `query`. A blank query or `k == 0` gives
    /// nothing; an index that was never built gives the single no-index
    /// result.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>> {
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if !self.index.is_built().await {
            tracing::debug!("Query received before any document was indexed");
            return Ok(vec![RetrievalResult::no_index()]);
        }

        let vector = embed_with_timeout(&self.embedder, vec![query.to_string()], self.timeout)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::BackendError("Embedder returned no vector".to_string()))?;

        let hits = match self.index.search_records(&vector, k).await {
            Ok(hits) => hits,
            Err(RagError::IndexAbsent) => return Ok(vec![RetrievalResult::no_index()]),
            Err(e) => return Err(e),
        };

        tracing::debug!("Retrieved {} chunks for query ({} chars)", hits.len(), query.chars().count());

        Ok(hits
            .into_iter()
            .map(|hit| RetrievalResult {
                chunk_text: hit.record.text,
                source_filename: hit.record.filename,
                position: hit.record.position,
                score: hit.distance,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::embeddings::HashEmbedder;
    use crate::rag::vector_store::NewChunk;

    const DIM: usize = 64;

    async fn retriever_with(texts: &[(&str, &str)]) -> Retriever {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new("hash", DIM));
        let index = Arc::new(VectorIndex::new("hash", DIM));
        let mut chunks = Vec::new();
        for (i, (filename, text)) in texts.iter().enumerate() {
            chunks.push(NewChunk {
                chunk_id: format!("c_{i}"),
                vector: embedder.embed_one(text).unwrap(),
                text: text.to_string(),
                filename: filename.to_string(),
                position: i + 1,
            });
        }
        index.add(chunks).await.unwrap();
        Retriever::new(index, embedder, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn returns_closest_chunk_with_provenance() {
        let retriever = retriever_with(&[
            ("a.txt", "rust borrow checker lifetimes"),
            ("b.txt", "baking sourdough bread at home"),
        ])
        .await;

        let results = retriever.retrieve("sourdough bread", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_filename, "b.txt");
        assert_eq!(results[0].position, 2);
        assert_eq!(results[0].chunk_text, "baking sourdough bread at home");
    }

    #[tokio::test]
    async fn blank_query_and_zero_k_return_nothing() {
        let retriever = retriever_with(&[("a.txt", "anything")]).await;
        assert!(retriever.retrieve("", 3).await.unwrap().is_empty());
        assert!(retriever.retrieve("   ", 3).await.unwrap().is_empty());
        assert!(retriever.retrieve("anything", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unbuilt_index_yields_sentinel() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new("hash", DIM));
        let retriever = Retriever::new(
            Arc::new(VectorIndex::new("hash", DIM)),
            embedder,
            Duration::from_secs(5),
        );

        let results = retriever.retrieve("question", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_no_index());
    }

    #[tokio::test]
    async fn built_but_empty_index_yields_nothing() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new("hash", DIM));
        let retriever = Retriever::new(
            Arc::new(VectorIndex::empty("hash", DIM)),
            embedder,
            Duration::from_secs(5),
        );
        assert!(retriever.retrieve("question", 5).await.unwrap().is_empty());
    }
}
