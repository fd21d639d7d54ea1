use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::document_store::DocumentStore;
use super::vector_store::{IndexEntry, IndexSnapshot};
use crate::error::{RagError, Result};

pub const VECTORS_FILE: &str = "vectors.json";
pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Serialize, Deserialize)]
struct VectorsFile {
    generation: Uuid,
    model_id: String,
    dimension: usize,
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataFile {
    generation: Uuid,
    records: DocumentStore,
}

/// Write `snapshot` as a vectors/metadata pair tagged with a fresh
/// generation id. Each file is replaced by rename.
pub fn write_snapshot(
    dir: &Path,
    model_id: &str,
    dimension: usize,
    snapshot: &IndexSnapshot,
) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| storage("create", dir, e))?;

    let generation = Uuid::new_v4();
    let vectors = VectorsFile {
        generation,
        model_id: model_id.to_string(),
        dimension,
        entries: snapshot.entries().to_vec(),
    };
    let metadata = MetadataFile {
        generation,
        records: snapshot.documents().clone(),
    };

    write_json(&dir.join(VECTORS_FILE), &vectors)?;
    write_json(&dir.join(METADATA_FILE), &metadata)?;

    tracing::info!(
        "Persisted {} chunks to {} (generation {})",
        snapshot.len(),
        dir.display(),
        generation
    );
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec(value)
        .map_err(|e| RagError::Storage(format!("Failed to serialize {}: {}", path.display(), e)))?;

    let mut file = fs::File::create(&tmp).map_err(|e| storage("create", &tmp, e))?;
    file.write_all(&bytes).map_err(|e| storage("write", &tmp, e))?;
    file.sync_all().map_err(|e| storage("sync", &tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| storage("rename", path, e))
}

fn storage(action: &str, path: &Path, e: io::Error) -> RagError {
    RagError::Storage(format!("Failed to {} {}: {}", action, path.display(), e))
}

/// Read the pair back. `Ok(None)` means there is nothing usable on disk:
/// a file is missing or unparsable, the generations differ, or the two files
/// do not describe the same chunks.
pub fn read_snapshot(
    dir: &Path,
    model_id: &str,
    dimension: usize,
) -> Result<Option<IndexSnapshot>> {
    let Some(vectors) = read_json::<VectorsFile>(&dir.join(VECTORS_FILE))? else {
        return Ok(None);
    };
    let Some(metadata) = read_json::<MetadataFile>(&dir.join(METADATA_FILE))? else {
        return Ok(None);
    };

    if vectors.generation != metadata.generation {
        tracing::warn!(
            "Index files in {} are from different writes ({} vs {})",
            dir.display(),
            vectors.generation,
            metadata.generation
        );
        return Ok(None);
    }

    if vectors.model_id != model_id || vectors.dimension != dimension {
        return Err(RagError::Config(format!(
            "Stored index was built with {} ({} dimensions), configured model is {} ({} dimensions)",
            vectors.model_id, vectors.dimension, model_id, dimension
        )));
    }

    match IndexSnapshot::from_parts(vectors.entries, metadata.records, dimension) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            tracing::warn!("Discarding inconsistent index in {}: {}", dir.display(), e);
            Ok(None)
        }
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("{} not found", path.display());
            return Ok(None);
        }
        Err(e) => return Err(storage("read", path, e)),
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!("Ignoring unreadable {}: {}", path.display(), e);
            Ok(None)
        }
    }
}
