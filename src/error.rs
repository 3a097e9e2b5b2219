use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading the anonymization rule script.
/// Both variants are fatal: without a script there is no tag-keep table
/// and no instance may be transformed.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("anonymizer script not found: {path}")]
    NotFound { path: PathBuf },
    #[error("failed to parse anonymizer script {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Instance-level errors raised by the PHI store.
#[derive(Debug, Error)]
pub enum PhiError {
    #[error("dataset missing required attributes: {0:?}")]
    MissingRequired(Vec<&'static str>),
    #[error("PHI store inconsistency: {0}")]
    Inconsistent(String),
}

/// The outcome classes of a single rejected or skipped instance.
/// Every variant except `AlreadyStored` maps onto a quarantine kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectionKind {
    #[error("file is not a DICOM instance")]
    InvalidDicom,
    #[error("I/O or decode error while reading DICOM file")]
    DicomReadError,
    #[error("dataset missing required attributes")]
    MissingAttributes,
    #[error("SOP class not accepted by this project")]
    InvalidStorageClass,
    #[error("PHI capture rejected the instance")]
    CapturePhiError,
    #[error("failed to write anonymized instance")]
    StorageError,
    #[error("instance already stored")]
    AlreadyStored,
}

/// Errors from persisting or reloading the PHI store snapshot.
/// Never fails a per-instance transaction: autosave logs and retries.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("PHI store snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PHI store snapshot codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
