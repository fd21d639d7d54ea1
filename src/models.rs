use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const NO_INDEX_FILENAME: &str = "n/a";
pub const NO_INDEX_TEXT: &str = "No document index is available.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// One retrieved chunk with its provenance. `score` is the L2 distance to
/// the query, lower is closer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_text: String,
    pub source_filename: String,
    pub position: usize,
    pub score: f32,
}

impl RetrievalResult {
    /// Stand-in returned when no index has been built.
    pub fn no_index() -> Self {
        Self {
            chunk_text: NO_INDEX_TEXT.to_string(),
            source_filename: NO_INDEX_FILENAME.to_string(),
            position: 0,
            score: f32::INFINITY,
        }
    }

    pub fn is_no_index(&self) -> bool {
        self.position == 0 && self.source_filename == NO_INDEX_FILENAME
    }
}

// OpenAI-compatible chat types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    /// Chunks the answer was grounded on; absent in backend responses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<RetrievalResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_used: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

// Document management types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub chunks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentListResponse {
    pub files: Vec<FileInfo>,
    pub total_chunks: usize,
}

impl From<BTreeMap<String, usize>> for DocumentListResponse {
    fn from(counts: BTreeMap<String, usize>) -> Self {
        let total_chunks = counts.values().sum();
        let files = counts
            .into_iter()
            .map(|(name, chunks)| FileInfo { name, chunks })
            .collect();
        Self {
            files,
            total_chunks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedFile {
    pub filename: String,
    pub chunks: usize,
    pub replaced: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedFile {
    pub filename: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub indexed: Vec<IngestedFile>,
    pub failed: Vec<FailedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub filename: String,
    pub removed_chunks: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStatus {
    pub is_indexing: bool,
    pub index_built: bool,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub total_files: usize,
    pub total_chunks: usize,
    pub failed_files: Vec<String>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_recognised() {
        let sentinel = RetrievalResult::no_index();
        assert!(sentinel.is_no_index());
        assert_eq!(sentinel.source_filename, "n/a");
        assert_eq!(sentinel.position, 0);

        let real = RetrievalResult {
            chunk_text: "text".to_string(),
            source_filename: "a.pdf".to_string(),
            position: 1,
            score: 0.2,
        };
        assert!(!real.is_no_index());
    }

    #[test]
    fn backend_response_without_extensions_parses() {
        let body = r#"{
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "local",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}]
        }"#;
        let response: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.choices[0].message.content, "hi");
        assert!(response.sources.is_empty());
    }

    #[test]
    fn document_list_sums_chunks() {
        let mut counts = BTreeMap::new();
        counts.insert("a.pdf".to_string(), 3);
        counts.insert("b.txt".to_string(), 2);
        let list = DocumentListResponse::from(counts);
        assert_eq!(list.total_chunks, 5);
        assert_eq!(list.files[0].name, "a.pdf");
    }
}
