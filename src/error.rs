use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported format for {filename}: {reason}")]
    UnsupportedFormat { filename: String, reason: String },

    #[error("No document index has been built yet")]
    IndexAbsent,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Duplicate chunk id: {0}")]
    DuplicateChunk(String),

    #[error("Document already indexed: {0}")]
    DuplicateDocument(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RagError {
    pub fn unsupported(filename: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::UnsupportedFormat {
            filename: filename.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_document() {
        let err = RagError::unsupported("deck.key", "unknown file extension");
        assert_eq!(
            err.to_string(),
            "Unsupported format for deck.key: unknown file extension"
        );
        assert_eq!(
            RagError::DimensionMismatch { expected: 384, actual: 3 }.to_string(),
            "Vector dimension mismatch: expected 384, got 3"
        );
    }
}
