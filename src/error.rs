use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the save pipeline.
///
/// Every variant carries enough context (template, attempted path, underlying
/// cause) to diagnose a failed save without looking at internals.
#[derive(Debug, Error)]
pub enum SaveError {
    /// The template is malformed, references an unknown value, or resolves to
    /// an unsafe path. Raised before anything touches the filesystem.
    #[error("invalid template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    /// Collision probing ran out of attempts.
    #[error("no free name for template '{template}' in {} after {attempts} probes", .directory.display())]
    PathCollisionExhausted {
        directory: PathBuf,
        template: String,
        attempts: u32,
    },

    /// Writing, linking or indexing a file failed. Nothing is left visible
    /// under the final name.
    #[error("failed to write {}: {source}", .path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading an existing file or the index failed.
    #[error("failed to read {}: {source}", .path.display())]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The format is unknown or the payload cannot carry the metadata.
    #[error("cannot embed metadata for format '{format}': {reason}")]
    CodecError { format: String, reason: String },

    /// The bytes on disk differ from the bytes that were meant to be written.
    #[error("digest mismatch for {}: expected {expected}, found {actual}", .path.display())]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl SaveError {
    pub(crate) fn invalid_template(template: &str, reason: impl Into<String>) -> Self {
        SaveError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn codec(format: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        SaveError::CodecError {
            format: format.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SaveError::WriteFailure {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SaveError::ReadFailure {
            path: path.into(),
            source,
        }
    }

    /// A commit found its target name already taken on disk.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            SaveError::WriteFailure { source, .. } if source.kind() == io::ErrorKind::AlreadyExists
        )
    }

    /// Short, stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SaveError::InvalidTemplate { .. } => "invalid_template",
            SaveError::PathCollisionExhausted { .. } => "collision_exhausted",
            SaveError::WriteFailure { .. } => "write_failure",
            SaveError::ReadFailure { .. } => "read_failure",
            SaveError::CodecError { .. } => "codec_error",
            SaveError::DigestMismatch { .. } => "digest_mismatch",
        }
    }
}

pub type SaveResult<T> = Result<T, SaveError>;
