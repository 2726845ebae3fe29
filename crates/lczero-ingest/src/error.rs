//! Error types for the ingestion pipeline
//!
//! Record- and chunk-scoped errors are absorbed inside the decode workers and
//! only surface as diagnostics. Configuration errors are returned from
//! `Pipeline::start` and prevent startup.

use std::path::PathBuf;

use crate::record::{FormatVersion, InputFormat};
use crate::source::ChunkRole;

/// A single record that cannot be decoded
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MalformedRecord {
    /// Byte length differs from the version's fixed record size
    #[error("{version} record must be {expected} bytes, got {actual}")]
    SizeMismatch {
        version: FormatVersion,
        expected: usize,
        actual: usize,
    },

    /// Embedded version tag does not match the layout used to decode
    #[error("version tag {found} in a {expected} record")]
    VersionTag { expected: FormatVersion, found: u32 },

    /// NaN or infinity in a probability / float field
    #[error("non-finite value in field `{field}`")]
    NonFinite { field: &'static str },

    /// V5 input format differs from the configured one
    #[error("input format {found} does not match expected {expected}")]
    InputFormat { expected: u32, found: u32 },
}

impl MalformedRecord {
    pub(crate) fn input_format(expected: InputFormat, found: InputFormat) -> Self {
        MalformedRecord::InputFormat {
            expected: expected.0,
            found: found.0,
        }
    }
}

/// Version inference from the decompressed chunk length
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionDetectError {
    #[error("length {len} is a multiple of several record sizes ({candidates:?})")]
    Ambiguous {
        len: u64,
        candidates: Vec<FormatVersion>,
    },

    #[error("length {len} is not a multiple of any known record size")]
    Undetectable { len: u64 },
}

/// Why a chunk file was skipped
#[derive(thiserror::Error, Debug)]
pub enum ChunkErrorKind {
    #[error("cannot open: {0}")]
    Open(#[source] std::io::Error),

    #[error("cannot decompress: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("chunk is empty")]
    Empty,

    #[error("{len} bytes is not a multiple of the {version} record size {record_size}")]
    NotDivisible {
        len: u64,
        version: FormatVersion,
        record_size: usize,
    },

    #[error(transparent)]
    Version(#[from] VersionDetectError),

    #[error("stream ended after {read} of {expected} records")]
    Truncated { read: u64, expected: u64 },

    /// Probe or read abandoned because the pipeline was cancelled
    #[error("interrupted by shutdown")]
    Interrupted,
}

/// A chunk file that cannot be read; the file is skipped entirely
#[derive(thiserror::Error, Debug)]
#[error("chunk {}: {kind}", .path.display())]
pub struct ChunkReadError {
    pub path: PathBuf,
    #[source]
    pub kind: ChunkErrorKind,
}

impl ChunkReadError {
    pub fn new(path: impl Into<PathBuf>, kind: ChunkErrorKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Item-level failure while streaming a chunk
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    /// The record at `index` is dropped; the stream continues
    #[error("record {index}: {source}")]
    Record {
        index: u64,
        #[source]
        source: MalformedRecord,
    },

    /// The rest of the chunk is unreadable; the stream ends
    #[error(transparent)]
    Chunk(#[from] ChunkReadError),
}

/// Fatal configuration problems, reported before any worker starts
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("no chunk files found for {patterns:?}; set allow_less_chunks to proceed anyway")]
    NoChunks { patterns: Vec<String> },

    #[error("found {found} chunks, requested {requested}; set allow_less_chunks to proceed")]
    TooFewChunks { found: usize, requested: usize },

    #[error(
        "train_ratio {train_ratio} leaves no {role:?} chunks out of {available}; set allow_less_chunks to proceed"
    )]
    EmptySplit {
        role: ChunkRole,
        available: usize,
        train_ratio: f64,
    },

    #[error("invalid glob pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("{} matches both the train and test patterns", .path.display())]
    OverlappingSplit { path: PathBuf },

    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("unknown input format `{0}`")]
    UnknownInputFormat(String),

    #[error("unsupported format version {0} (expected 3, 4 or 5)")]
    UnsupportedVersion(u32),

    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors returned by the pipeline controller
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Expected after `stop()`; not a data error
    #[error("pipeline has been shut down")]
    Shutdown,

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, PipelineError::Shutdown)
    }
}
