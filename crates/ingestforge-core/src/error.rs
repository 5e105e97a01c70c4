//! Unified error type for the ingest engine.
//!
//! All components funnel their failures into [`Error`], whose variants map
//! the ingest error taxonomy: access, not-found, verify mismatch, external
//! service, user-canceled, and internal. Per-file errors are accumulated
//! into category summaries by the scheduler rather than interrupting a run.

use std::fmt;
use std::path::PathBuf;

/// The kind of mismatch found when verifying a copied file against its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMismatch {
    /// Destination length differs from the source.
    Size,
    /// Byte-for-byte comparison found differing content.
    Content,
    /// Digest comparison found differing hashes.
    Hash,
}

impl fmt::Display for VerifyMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyMismatch::Size => write!(f, "size"),
            VerifyMismatch::Content => write!(f, "content"),
            VerifyMismatch::Hash => write!(f, "hash"),
        }
    }
}

/// Unified error type covering all failure modes in the ingest engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The destination is read-only or the file is currently in use.
    #[error("Access denied for {path}: {reason}")]
    Access {
        /// The path that could not be touched.
        path: PathBuf,
        /// Human-readable reason (e.g. "file in use").
        reason: String,
    },

    /// A non-optional source file or resource is missing.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "source file", "task").
        entity: String,
        /// The identifier or path that was looked up.
        id: String,
    },

    /// Post-copy verification found the destination differs from the source.
    #[error("Verify mismatch ({kind}) for {path}")]
    Verify {
        /// What differed.
        kind: VerifyMismatch,
        /// The destination that failed verification.
        path: PathBuf,
    },

    /// An external collaborator (encoder, importer) failed or rejected work.
    #[error("External service error [{service}]: {message}")]
    ExternalService {
        /// Name of the collaborator that failed.
        service: String,
        /// Human-readable error description.
        message: String,
    },

    /// The user declined a prompt, canceling the entire run.
    #[error("Canceled by user: {0}")]
    UserCanceled(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience constructor for [`Error::Access`].
    pub fn access(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Access {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Verify`].
    pub fn verify(kind: VerifyMismatch, path: impl Into<PathBuf>) -> Self {
        Error::Verify {
            kind,
            path: path.into(),
        }
    }

    /// Convenience constructor for [`Error::ExternalService`].
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Whether this error cancels the entire run rather than a single file.
    ///
    /// Only a declined exist-conflict prompt does; every per-file failure is
    /// recorded and the run continues.
    pub fn cancels_run(&self) -> bool {
        matches!(self, Error::UserCanceled(_))
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
