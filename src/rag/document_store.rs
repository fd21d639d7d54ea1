use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable id for a source filename: the first 8 bytes of its SHA-256, hex.
pub fn document_id(filename: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

/// A parsed source document. Re-ingesting a filename produces a new value,
/// never a mutation of the old one.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub raw_text: String,
    pub source_filename: String,
    pub ingested_at: DateTime<Utc>,
}

impl Document {
    pub fn new(source_filename: impl Into<String>, raw_text: impl Into<String>) -> Self {
        let source_filename = source_filename.into();
        Self {
            id: document_id(&source_filename),
            raw_text: raw_text.into(),
            source_filename,
            ingested_at: Utc::now(),
        }
    }

    pub fn chunk_id(&self, chunk_index: usize) -> String {
        format!("{}_{}", self.id, chunk_index)
    }
}

/// Provenance and text for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub text: String,
    pub filename: String,
    /// 1-based position of the chunk within its document.
    pub position: usize,
}

/// `chunk_id → ChunkRecord`. Ordered so persisted metadata is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentStore {
    records: BTreeMap<String, ChunkRecord>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chunk_id: &str) -> Option<&ChunkRecord> {
        self.records.get(chunk_id)
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.records.contains_key(chunk_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ChunkRecord)> {
        self.records.iter()
    }

    pub fn contains_file(&self, filename: &str) -> bool {
        self.records.values().any(|r| r.filename == filename)
    }

    /// Chunk count per filename.
    pub fn filenames(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in self.records.values() {
            *counts.entry(record.filename.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub(crate) fn insert(&mut self, chunk_id: String, record: ChunkRecord) -> Option<ChunkRecord> {
        self.records.insert(chunk_id, record)
    }

    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&ChunkRecord) -> bool) {
        self.records.retain(|_, record| keep(record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(filename: &str, position: usize) -> ChunkRecord {
        ChunkRecord {
            text: format!("text {position}"),
            filename: filename.to_string(),
            position,
        }
    }

    #[test]
    fn document_ids_are_stable_per_filename() {
        assert_eq!(document_id("report.pdf"), document_id("report.pdf"));
        assert_ne!(document_id("report.pdf"), document_id("report.docx"));
        assert_eq!(document_id("report.pdf").len(), 16);

        let doc = Document::new("report.pdf", "body");
        assert_eq!(doc.chunk_id(3), format!("{}_3", document_id("report.pdf")));
    }

    #[test]
    fn counts_chunks_per_file() {
        let mut store = DocumentStore::new();
        store.insert("a_0".to_string(), record("a.pdf", 1));
        store.insert("a_1".to_string(), record("a.pdf", 2));
        store.insert("b_0".to_string(), record("b.pdf", 1));

        let counts = store.filenames();
        assert_eq!(counts.get("a.pdf"), Some(&2));
        assert_eq!(counts.get("b.pdf"), Some(&1));
        assert!(store.contains_file("b.pdf"));
        assert!(!store.contains_file("c.pdf"));
    }

    #[test]
    fn retain_drops_matching_records() {
        let mut store = DocumentStore::new();
        store.insert("a_0".to_string(), record("a.pdf", 1));
        store.insert("b_0".to_string(), record("b.pdf", 1));

        store.retain(|r| r.filename != "a.pdf");
        assert_eq!(store.len(), 1);
        assert!(store.get("a_0").is_none());
        assert_eq!(store.get("b_0").map(|r| r.position), Some(1));
    }
}
