use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

use crate::backend::BackendError;

#[derive(Debug, Error)]
pub enum PasteError {
    /// The caller sent something out of shape or out of range.
    #[error("{0}")]
    Validation(String),
    /// Unknown id, or a paste that expired. Callers can't tell which.
    #[error("Paste not found")]
    NotFound,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PasteError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
    #[error("storage task failed: {0}")]
    Join(#[from] JoinError),
    #[error("gave up after {0} conflicting updates")]
    Contention(usize),
    #[error("could not find a free id after {0} attempts")]
    IdExhausted(usize),
    #[error("failed to encode or decode a paste: {0}")]
    Codec(#[from] bincode::Error),
}
