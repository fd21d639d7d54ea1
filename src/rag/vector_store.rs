use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::document_store::{ChunkRecord, DocumentStore};
use super::persistence;
use crate::error::{RagError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub vector: Vec<f32>,
}

/// One chunk on its way into the index.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub filename: String,
    pub position: usize,
}

/// What to do when a file that is already indexed is ingested again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    #[default]
    Reject,
    Replace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordHit {
    pub chunk_id: String,
    pub distance: f32,
    pub record: ChunkRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInsert {
    pub added: usize,
    pub replaced: usize,
}

/// An immutable published state of the index. Entries and records always
/// describe the same set of chunk ids.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    entries: Vec<IndexEntry>,
    documents: DocumentStore,
}

impl IndexSnapshot {
    /// Assemble a snapshot from persisted parts, checking the one-to-one
    /// mapping between entries and records.
    pub(crate) fn from_parts(
        entries: Vec<IndexEntry>,
        documents: DocumentStore,
        dimension: usize,
    ) -> Result<Self> {
        if entries.len() != documents.len() {
            return Err(RagError::Storage(format!(
                "{} vectors but {} metadata records",
                entries.len(),
                documents.len()
            )));
        }

        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if entry.vector.len() != dimension {
                return Err(RagError::DimensionMismatch {
                    expected: dimension,
                    actual: entry.vector.len(),
                });
            }
            if !seen.insert(entry.chunk_id.as_str()) {
                return Err(RagError::DuplicateChunk(entry.chunk_id.clone()));
            }
            if !documents.contains(&entry.chunk_id) {
                return Err(RagError::Storage(format!(
                    "No metadata for chunk {}",
                    entry.chunk_id
                )));
            }
        }

        Ok(Self { entries, documents })
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact scan: `(entry index, L2 distance)`, closest first. The sort is
    /// stable so equal distances keep insertion order.
    fn rank(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (i, squared_l2(query, &entry.vector)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(i, squared)| (i, squared.sqrt()))
            .collect()
    }

    fn without_file(&self, filename: &str) -> (Self, usize) {
        let mut documents = self.documents.clone();
        documents.retain(|record| record.filename != filename);
        let entries: Vec<IndexEntry> = self
            .entries
            .iter()
            .filter(|entry| documents.contains(&entry.chunk_id))
            .cloned()
            .collect();
        let removed = self.entries.len() - entries.len();
        (Self { entries, documents }, removed)
    }

    fn with_appended(mut self, chunks: Vec<NewChunk>) -> Self {
        self.entries.reserve(chunks.len());
        for chunk in chunks {
            self.documents.insert(
                chunk.chunk_id.clone(),
                ChunkRecord {
                    text: chunk.text,
                    filename: chunk.filename,
                    position: chunk.position,
                },
            );
            self.entries.push(IndexEntry {
                chunk_id: chunk.chunk_id,
                vector: chunk.vector,
            });
        }
        self
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Shared nearest-neighbour index over embedded chunks.
///
/// Readers clone the current snapshot pointer and search it without holding
/// a lock. Writers serialize on `writer`, build a complete new snapshot and
/// only then swap it in, so a search sees either the old or the new state.
/// An index with no snapshot has never been built.
pub struct VectorIndex {
    model_id: String,
    dimension: usize,
    current: RwLock<Option<Arc<IndexSnapshot>>>,
    writer: Mutex<()>,
    persist_lock: Mutex<()>,
}

impl VectorIndex {
    /// An unbuilt index; the first non-empty `add` builds it.
    pub fn new(model_id: impl Into<String>, dimension: usize) -> Self {
        Self::with_state(model_id.into(), dimension, None)
    }

    /// A built index with no entries.
    pub fn empty(model_id: impl Into<String>, dimension: usize) -> Self {
        Self::with_state(
            model_id.into(),
            dimension,
            Some(Arc::new(IndexSnapshot::default())),
        )
    }

    pub(crate) fn from_snapshot(model_id: String, dimension: usize, snapshot: IndexSnapshot) -> Self {
        Self::with_state(model_id, dimension, Some(Arc::new(snapshot)))
    }

    fn with_state(model_id: String, dimension: usize, state: Option<Arc<IndexSnapshot>>) -> Self {
        Self {
            model_id,
            dimension,
            current: RwLock::new(state),
            writer: Mutex::new(()),
            persist_lock: Mutex::new(()),
        }
    }

    /// Restore from `dir`, or fall back to an unbuilt index when nothing
    /// usable is stored there.
    pub async fn load_or_create(
        dir: &Path,
        model_id: impl Into<String>,
        dimension: usize,
    ) -> Result<Self> {
        let model_id = model_id.into();
        match Self::restore(dir, model_id.clone(), dimension).await? {
            Some(index) => Ok(index),
            None => {
                tracing::warn!(
                    "No usable index at {}; starting without one",
                    dir.display()
                );
                Ok(Self::new(model_id, dimension))
            }
        }
    }

    /// `Ok(None)` when the directory is missing, incomplete or corrupt.
    pub async fn restore(
        dir: &Path,
        model_id: impl Into<String>,
        dimension: usize,
    ) -> Result<Option<Self>> {
        let model_id = model_id.into();
        let dir: PathBuf = dir.to_path_buf();
        let expected_model = model_id.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            persistence::read_snapshot(&dir, &expected_model, dimension)
        })
        .await
        .map_err(|e| RagError::Storage(format!("Restore task failed: {}", e)))??;

        Ok(snapshot.map(|snapshot| {
            tracing::info!("Restored index with {} chunks", snapshot.len());
            Self::from_snapshot(model_id, dimension, snapshot)
        }))
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// The currently published state.
    pub async fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.current.read().await.clone()
    }

    pub async fn is_built(&self) -> bool {
        self.current.read().await.is_some()
    }

    pub async fn len(&self) -> usize {
        self.snapshot().await.map_or(0, |s| s.len())
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn filenames(&self) -> BTreeMap<String, usize> {
        self.snapshot()
            .await
            .map(|s| s.documents().filenames())
            .unwrap_or_default()
    }

    pub async fn contains_file(&self, filename: &str) -> bool {
        self.snapshot()
            .await
            .is_some_and(|s| s.documents().contains_file(filename))
    }

    async fn publish(&self, snapshot: IndexSnapshot) {
        *self.current.write().await = Some(Arc::new(snapshot));
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn validate_new(&self, base: Option<&IndexSnapshot>, chunks: &[NewChunk]) -> Result<()> {
        let mut batch_ids = HashSet::with_capacity(chunks.len());
        for chunk in chunks {
            self.check_dimension(&chunk.vector)?;
            let already_indexed = base.is_some_and(|s| s.documents().contains(&chunk.chunk_id));
            if already_indexed || !batch_ids.insert(chunk.chunk_id.as_str()) {
                return Err(RagError::DuplicateChunk(chunk.chunk_id.clone()));
            }
        }
        Ok(())
    }

    /// Append chunks. Nothing changes if any chunk is rejected.
    pub async fn add(&self, chunks: Vec<NewChunk>) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let _writer = self.writer.lock().await;
        let base = self.snapshot().await;
        self.validate_new(base.as_deref(), &chunks)?;

        let added = chunks.len();
        let next = base
            .as_deref()
            .cloned()
            .unwrap_or_default()
            .with_appended(chunks);
        let total = next.len();
        self.publish(next).await;

        tracing::debug!("Added {} chunks ({} total)", added, total);
        Ok(added)
    }

    /// Insert all chunks of one file in a single swap, applying `policy`
    /// when the file is already indexed.
    pub async fn add_file(
        &self,
        filename: &str,
        chunks: Vec<NewChunk>,
        policy: DuplicatePolicy,
    ) -> Result<FileInsert> {
        if let Some(stray) = chunks.iter().find(|c| c.filename != filename) {
            return Err(RagError::InvalidRequest(format!(
                "Chunk {} belongs to {}, not {}",
                stray.chunk_id, stray.filename, filename
            )));
        }

        let _writer = self.writer.lock().await;
        let current = self.snapshot().await;
        let exists = current
            .as_deref()
            .is_some_and(|s| s.documents().contains_file(filename));

        let (base, replaced) = match (current.as_deref(), exists, policy) {
            (_, true, DuplicatePolicy::Reject) => {
                return Err(RagError::DuplicateDocument(filename.to_string()));
            }
            (Some(snapshot), true, DuplicatePolicy::Replace) => snapshot.without_file(filename),
            (Some(snapshot), false, _) => (snapshot.clone(), 0),
            (None, _, _) => (IndexSnapshot::default(), 0),
        };

        if chunks.is_empty() && replaced == 0 {
            return Ok(FileInsert {
                added: 0,
                replaced: 0,
            });
        }

        self.validate_new(Some(&base), &chunks)?;
        let added = chunks.len();
        self.publish(base.with_appended(chunks)).await;

        tracing::info!(
            "Indexed {}: {} chunks added, {} replaced",
            filename,
            added,
            replaced
        );
        Ok(FileInsert { added, replaced })
    }

    /// The `k` closest chunk ids, closest first.
    pub async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let snapshot = self.snapshot().await.ok_or(RagError::IndexAbsent)?;
        self.check_dimension(query)?;

        Ok(snapshot
            .rank(query, k)
            .into_iter()
            .map(|(i, distance)| SearchHit {
                chunk_id: snapshot.entries[i].chunk_id.clone(),
                distance,
            })
            .collect())
    }

    /// Like [`search`](Self::search), joined with chunk records from the
    /// same snapshot.
    pub async fn search_records(&self, query: &[f32], k: usize) -> Result<Vec<RecordHit>> {
        let snapshot = self.snapshot().await.ok_or(RagError::IndexAbsent)?;
        self.check_dimension(query)?;

        snapshot
            .rank(query, k)
            .into_iter()
            .map(|(i, distance)| {
                let chunk_id = &snapshot.entries[i].chunk_id;
                let record = snapshot.documents.get(chunk_id).cloned().ok_or_else(|| {
                    RagError::Storage(format!("No metadata for chunk {}", chunk_id))
                })?;
                Ok(RecordHit {
                    chunk_id: chunk_id.clone(),
                    distance,
                    record,
                })
            })
            .collect()
    }

    /// Drop every chunk of `filename` by rebuilding from the retained
    /// entries. Returns the number of chunks removed.
    pub async fn remove_by_filename(&self, filename: &str) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let Some(current) = self.snapshot().await else {
            return Ok(0);
        };

        let (rebuilt, removed) = current.without_file(filename);
        if removed == 0 {
            return Ok(0);
        }
        let remaining = rebuilt.len();
        self.publish(rebuilt).await;

        tracing::info!(
            "Removed {} chunks of {} ({} remaining)",
            removed,
            filename,
            remaining
        );
        Ok(removed)
    }

    /// Write the current snapshot to `dir`. Persists are serialized from
    /// capture to rename, so the last capture is the one left on disk. The
    /// writer lock is held only while the snapshot is captured.
    pub async fn persist(&self, dir: &Path) -> Result<()> {
        let _persisting = self.persist_lock.lock().await;
        let snapshot = {
            let _writer = self.writer.lock().await;
            self.snapshot().await
        };
        let Some(snapshot) = snapshot else {
            tracing::debug!("Index not built; nothing to persist");
            return Ok(());
        };

        let dir = dir.to_path_buf();
        let model_id = self.model_id.clone();
        let dimension = self.dimension;
        tokio::task::spawn_blocking(move || {
            persistence::write_snapshot(&dir, &model_id, dimension, &snapshot)
        })
        .await
        .map_err(|e| RagError::Storage(format!("Persist task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, filename: &str, position: usize, vector: Vec<f32>) -> NewChunk {
        NewChunk {
            chunk_id: id.to_string(),
            vector,
            text: format!("{id} text"),
            filename: filename.to_string(),
            position,
        }
    }

    async fn two_file_index() -> VectorIndex {
        let index = VectorIndex::empty("test", 2);
        index
            .add(vec![
                chunk("x_0", "x.pdf", 1, vec![0.0, 0.0]),
                chunk("x_1", "x.pdf", 2, vec![1.0, 0.0]),
                chunk("y_0", "y.pdf", 1, vec![0.0, 1.0]),
                chunk("y_1", "y.pdf", 2, vec![5.0, 5.0]),
            ])
            .await
            .unwrap();
        index
    }

    #[tokio::test]
    async fn search_orders_by_distance() {
        let index = two_file_index().await;
        let hits = index.search(&[0.9, 0.1], 3).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["x_1", "x_0", "y_0"]);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[tokio::test]
    async fn ties_keep_insertion_order() {
        let index = VectorIndex::empty("test", 2);
        index
            .add(vec![
                chunk("b", "f", 1, vec![1.0, 0.0]),
                chunk("a", "f", 2, vec![-1.0, 0.0]),
                chunk("c", "f", 3, vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        let hits = index.search(&[0.0, 0.0], 3).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn zero_k_and_empty_index_return_nothing() {
        let index = two_file_index().await;
        assert!(index.search(&[0.0, 0.0], 0).await.unwrap().is_empty());

        let empty = VectorIndex::empty("test", 2);
        assert!(empty.search(&[0.0, 0.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unbuilt_index_reports_absent() {
        let index = VectorIndex::new("test", 2);
        assert!(!index.is_built().await);
        assert!(matches!(
            index.search(&[0.0, 0.0], 1).await,
            Err(RagError::IndexAbsent)
        ));
        assert_eq!(index.remove_by_filename("x.pdf").await.unwrap(), 0);

        index.add(vec![chunk("a", "a.txt", 1, vec![1.0, 1.0])]).await.unwrap();
        assert!(index.is_built().await);
    }

    #[tokio::test]
    async fn empty_add_is_a_no_op() {
        let index = VectorIndex::new("test", 2);
        assert_eq!(index.add(Vec::new()).await.unwrap(), 0);
        assert!(!index.is_built().await);
    }

    #[tokio::test]
    async fn rejects_dimension_mismatch_without_mutation() {
        let index = two_file_index().await;
        let result = index
            .add(vec![
                chunk("z_0", "z.pdf", 1, vec![1.0, 2.0]),
                chunk("z_1", "z.pdf", 2, vec![1.0, 2.0, 3.0]),
            ])
            .await;
        assert!(matches!(
            result,
            Err(RagError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert_eq!(index.len().await, 4);
        assert!(!index.contains_file("z.pdf").await);

        assert!(matches!(
            index.search(&[1.0], 1).await,
            Err(RagError::DimensionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_duplicate_chunk_ids() {
        let index = two_file_index().await;
        let result = index.add(vec![chunk("x_0", "x.pdf", 1, vec![0.0, 0.0])]).await;
        assert!(matches!(result, Err(RagError::DuplicateChunk(id)) if id == "x_0"));

        let result = index
            .add(vec![
                chunk("n_0", "n.pdf", 1, vec![0.0, 0.0]),
                chunk("n_0", "n.pdf", 2, vec![0.0, 0.0]),
            ])
            .await;
        assert!(matches!(result, Err(RagError::DuplicateChunk(_))));
        assert_eq!(index.len().await, 4);
    }

    #[tokio::test]
    async fn remove_by_filename_keeps_other_files() {
        let index = two_file_index().await;
        let before = index.snapshot().await.unwrap();

        assert_eq!(index.remove_by_filename("x.pdf").await.unwrap(), 2);

        let hits = index.search_records(&[0.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.record.filename == "y.pdf"));
        assert_eq!(hits[0].record.position, 1);

        // the previous snapshot is untouched
        assert_eq!(before.len(), 4);
        assert_eq!(index.remove_by_filename("x.pdf").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn add_file_rejects_or_replaces_duplicates() {
        let index = two_file_index().await;

        let result = index
            .add_file(
                "x.pdf",
                vec![chunk("x2_0", "x.pdf", 1, vec![3.0, 3.0])],
                DuplicatePolicy::Reject,
            )
            .await;
        assert!(matches!(result, Err(RagError::DuplicateDocument(f)) if f == "x.pdf"));

        let outcome = index
            .add_file(
                "x.pdf",
                vec![chunk("x_0", "x.pdf", 1, vec![3.0, 3.0])],
                DuplicatePolicy::Replace,
            )
            .await
            .unwrap();
        assert_eq!(outcome, FileInsert { added: 1, replaced: 2 });
        assert_eq!(index.filenames().await.get("x.pdf"), Some(&1));
        assert_eq!(index.len().await, 3);
    }

    #[tokio::test]
    async fn add_file_rejects_foreign_chunks() {
        let index = VectorIndex::new("test", 2);
        let result = index
            .add_file(
                "a.txt",
                vec![chunk("b_0", "b.txt", 1, vec![0.0, 0.0])],
                DuplicatePolicy::Reject,
            )
            .await;
        assert!(matches!(result, Err(RagError::InvalidRequest(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_persists_leave_the_latest_state_on_disk() {
        for _ in 0..20 {
            let dir = tempfile::tempdir().unwrap();
            let index = Arc::new(two_file_index().await);

            let early = {
                let index = Arc::clone(&index);
                let path = dir.path().to_path_buf();
                tokio::spawn(async move { index.persist(&path).await })
            };
            let late = {
                let index = Arc::clone(&index);
                let path = dir.path().to_path_buf();
                tokio::spawn(async move {
                    index.remove_by_filename("x.pdf").await?;
                    index.persist(&path).await
                })
            };
            early.await.unwrap().unwrap();
            late.await.unwrap().unwrap();

            let restored = VectorIndex::restore(dir.path(), "test", 2)
                .await
                .unwrap()
                .unwrap();
            assert!(!restored.contains_file("x.pdf").await);
            assert_eq!(restored.len().await, 2);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_see_partial_removal() {
        let index = Arc::new(VectorIndex::empty("test", 2));
        let mut chunks = Vec::new();
        for i in 0..200 {
            chunks.push(chunk(&format!("x_{i}"), "x.pdf", i + 1, vec![i as f32, 0.0]));
            chunks.push(chunk(&format!("y_{i}"), "y.pdf", i + 1, vec![0.0, i as f32]));
        }
        index.add(chunks).await.unwrap();

        let mut readers = Vec::new();
        for _ in 0..4 {
            let index = Arc::clone(&index);
            readers.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let hits = index.search_records(&[1.0, 1.0], 1000).await.unwrap();
                    let from_x = hits.iter().filter(|h| h.record.filename == "x.pdf").count();
                    assert!(
                        (hits.len() == 400 && from_x == 200) || (hits.len() == 200 && from_x == 0),
                        "torn read: {} hits, {} from x.pdf",
                        hits.len(),
                        from_x
                    );
                    tokio::task::yield_now().await;
                }
            }));
        }

        let writer = {
            let index = Arc::clone(&index);
            tokio::spawn(async move { index.remove_by_filename("x.pdf").await })
        };

        assert_eq!(writer.await.unwrap().unwrap(), 200);
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(index.len().await, 200);
    }
}
