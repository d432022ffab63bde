//! Error types for the worker registry.

use sworker_db::BackendError;
use sworker_ids::{RegistrationId, WorkerId};
use thiserror::Error;

/// Registry operation result type.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors surfaced to the install/update orchestrator.
///
/// Every error aborts the current attempt; nothing here is retried.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker not found: {0}")]
    NotFound(WorkerId),

    #[error("Worker {worker_id} belongs to registration {expected}, not {actual}")]
    IdentityMismatch {
        worker_id: WorkerId,
        expected: RegistrationId,
        actual: RegistrationId,
    },

    #[error("Worker {0} already has content")]
    AlreadyPopulated(WorkerId),

    #[error("Worker {0} has no content hash")]
    VerificationFailure(WorkerId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] BackendError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored or streamed data contradicts itself (unknown state text, a body
    /// whose length changed between download and copy, ...).
    #[error("Corrupt worker data: {0}")]
    Corrupt(String),

    #[error("Invalid update request: {0}")]
    Request(#[from] http::Error),
}

/// Coarse classification of [`WorkerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    IdentityMismatch,
    AlreadyPopulated,
    VerificationFailure,
    IoFailure,
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::IdentityMismatch { .. } => ErrorKind::IdentityMismatch,
            Self::AlreadyPopulated(_) => ErrorKind::AlreadyPopulated,
            Self::VerificationFailure(_) => ErrorKind::VerificationFailure,
            Self::Io(_)
            | Self::Database(_)
            | Self::Serialization(_)
            | Self::Corrupt(_)
            | Self::Request(_) => ErrorKind::IoFailure,
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
}
