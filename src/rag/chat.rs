use std::sync::Arc;

use serde::Serialize;

use super::augment::augment;
use super::retriever::Retriever;
use crate::completion::CompletionClient;
use crate::error::{RagError, Result};
use crate::models::{Message, RetrievalResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatAnswer {
    pub response: String,
    pub sources: Vec<RetrievalResult>,
    pub context_used: bool,
    pub index_available: bool,
}

pub struct ChatService {
    retriever: Retriever,
    completion: Arc<dyn CompletionClient>,
    top_k: usize,
    default_temperature: f32,
}

impl ChatService {
    pub fn new(
        retriever: Retriever,
        completion: Arc<dyn CompletionClient>,
        top_k: usize,
        default_temperature: f32,
    ) -> Self {
        Self {
            retriever,
            completion,
            top_k,
            default_temperature,
        }
    }

    /// Answer the last user message of `history`, grounded on retrieved
    /// chunks when there are any.
    pub async fn answer(&self, history: &[Message], temperature: Option<f32>) -> Result<ChatAnswer> {
        let query = history
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .ok_or_else(|| RagError::InvalidRequest("No user message found".to_string()))?;

        let retrieved = self.retriever.retrieve(query, self.top_k).await?;
        let index_available = !retrieved.iter().any(RetrievalResult::is_no_index);
        let sources: Vec<RetrievalResult> = retrieved
            .into_iter()
            .filter(|r| !r.is_no_index())
            .collect();

        let (messages, context_used) = augment(history, &sources);
        tracing::info!(
            "Answering with {} sources (context used: {})",
            sources.len(),
            context_used
        );

        let response = self
            .completion
            .complete(&messages, temperature.unwrap_or(self.default_temperature))
            .await
            .inspect_err(|e| tracing::error!("Completion failed: {}", e))?;

        Ok(ChatAnswer {
            response,
            sources,
            context_used,
            index_available,
        })
    }
}
