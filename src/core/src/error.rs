use std::path::PathBuf;

use thiserror::Error;

/// Airlift error types
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Configuration validation failure; fatal before any I/O
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Imageset arrived out of order at publish
    #[error("invalid mirror sequence order, want {expected}, got {got}")]
    Sequence { expected: u64, got: u64 },

    /// Workspace identity mismatch; recovered by starting a new workspace
    #[error("mismatched workspace uuids, want {current}, got {incoming}")]
    UuidMismatch {
        current: uuid::Uuid,
        incoming: uuid::Uuid,
    },

    /// No metadata image or file exists yet for this workspace
    #[error("metadata not found at {0}")]
    MetadataNotFound(String),

    /// An optional artifact was not present in the archive
    #[error("file {0} not found in archive")]
    ArchiveFileNotFound(String),

    /// The association step could not locate a mapping for an image
    #[error("no mapping found for image {0}")]
    NoMapping(String),

    /// A layer or manifest reference could not be matched to any component
    #[error("invalid component: {0}")]
    InvalidComponent(String),

    /// Image reference parse failure
    #[error("invalid image reference {reference:?}: {message}")]
    Reference { reference: String, message: String },

    /// Registry transport error; status carries the HTTP code when known
    #[error("registry error for {reference}: {message}")]
    Registry {
        reference: String,
        status: Option<u16>,
        message: String,
    },

    /// Unauthorized or denied by the registry; never retried
    #[error("authentication failed for {0}")]
    Auth(String),

    /// The requested manifest does not exist at the source
    #[error("manifest unknown for {0}")]
    ManifestUnknown(String),

    /// Transient network or I/O failure; candidate for retry
    #[error("transient error: {0}")]
    Transient(String),

    /// Catalog image rebuild failure; fatal for that catalog only
    #[error("catalog build error for {reference}: {message}")]
    Build { reference: String, message: String },

    /// The Cincinnati upgrade graph query failed
    #[error("upgrade graph error for channel {channel}: {message}")]
    Graph { channel: String, message: String },

    /// The run was cancelled before completion
    #[error("operation cancelled")]
    Cancelled,

    /// Archive packaging or extraction failure
    #[error("archive error at {path}: {message}")]
    Archive { path: PathBuf, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Several independent failures collected by a planner
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<MirrorError>),
}

impl MirrorError {
    /// Collapse a list of errors into `None` (empty), the single error, or
    /// a [`MirrorError::Aggregate`].
    pub fn aggregate(mut errs: Vec<MirrorError>) -> Option<MirrorError> {
        match errs.len() {
            0 => None,
            1 => Some(errs.remove(0)),
            _ => Some(MirrorError::Aggregate(errs)),
        }
    }

    /// Walk aggregates, yielding every leaf error.
    pub fn leaves(&self) -> Vec<&MirrorError> {
        match self {
            MirrorError::Aggregate(errs) => errs.iter().flat_map(|e| e.leaves()).collect(),
            other => vec![other],
        }
    }
}

fn format_aggregate(errs: &[MirrorError]) -> String {
    let msgs: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
    format!("{} errors occurred: [{}]", errs.len(), msgs.join("; "))
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for MirrorError {
    fn from(err: serde_yaml::Error) -> Self {
        MirrorError::Serialization(err.to_string())
    }
}

/// Result type alias for airlift operations
pub type Result<T> = std::result::Result<T, MirrorError>;
