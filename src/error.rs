//! Error types shared across the pipeline.
//!
//! Each type carries its blast radius: ingestion and embedding errors are
//! scoped to one unit (a day, a file, a row) and the run continues, while a
//! schema mismatch or a missing model artifact stops the run.

use std::path::PathBuf;
use thiserror::Error;

/// A unit of input (weather file, image filename, labeled file) could not be read.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed csv in {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path:?} line {line}: expected {expected} columns, found {found}")]
    MissingColumn {
        path: PathBuf,
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("malformed timestamp {value:?}: {reason}")]
    MalformedTimestamp { value: String, reason: String },

    #[error("{path:?} line {line}: malformed {field} value {value:?}")]
    MalformedValue {
        path: PathBuf,
        line: u64,
        field: &'static str,
        value: String,
    },

    #[error("{path:?} contains no observations")]
    Empty { path: PathBuf },
}

/// The embedding provider could not produce a vector for an image.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("cannot decode image {path:?}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("embedding for {path:?} has {found} values, provider declares {expected}")]
    Dimension {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
}

/// A row or input width disagrees with the schema it is checked against.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema mismatch in {context}: expected width {expected}, found {found}")]
pub struct SchemaMismatchError {
    pub context: String,
    pub expected: usize,
    pub found: usize,
}

impl SchemaMismatchError {
    pub fn new(context: impl Into<String>, expected: usize, found: usize) -> Self {
        Self {
            context: context.into(),
            expected,
            found,
        }
    }
}

/// A dataset header does not describe the feature layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("{found} columns is too few (need at least {required})")]
    TooFewColumns { found: usize, required: usize },

    #[error("trailing columns {found:?}, expected {expected:?}")]
    UnexpectedColumns { found: Vec<String>, expected: Vec<String> },
}

/// Errors while reading or writing the cumulative feature dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dataset csv error at {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("dataset {path:?} has an unrecognised header: {source}")]
    Header {
        path: PathBuf,
        #[source]
        source: HeaderError,
    },

    #[error(transparent)]
    Schema(#[from] SchemaMismatchError),
}

/// Errors from the dual-head model: loading, saving, training, inference.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model artifact not found at {0:?}")]
    ArtifactMissing(PathBuf),

    #[error("model io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("model artifact {path:?} is not valid: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported artifact format version {found} (expected {expected})")]
    Version { expected: u32, found: u32 },

    #[error("input adapter produced shape {found:?}; the network accepts a single time step")]
    UnsupportedShape { found: [usize; 4] },

    #[error("{field} is not a finite number: {value}")]
    NonFiniteInput { field: &'static str, value: f32 },

    #[error("not enough rows to train: {rows} (need at least {required})")]
    InsufficientData { rows: usize, required: usize },

    #[error(transparent)]
    Schema(#[from] SchemaMismatchError),
}

/// Configuration load/save errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Fatal errors that abort a pipeline command.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Schema(#[from] SchemaMismatchError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error("cannot list {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
