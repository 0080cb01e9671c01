//! Error types for the replacement engine.
//!
//! [`ReplaceError`] is the resource-scoped failure taxonomy: every variant
//! describes why *one* resource could not be applied, and none of them is
//! fatal to the surrounding operation. The orchestrator folds each error into
//! the report through [`ReplaceError::kind`].
//!
//! [`MediatorError`] covers process-level operations (suspend, resume,
//! terminate). The ladder never propagates it; a mediator error means "this
//! rung is unavailable".

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ReplaceError
// ---------------------------------------------------------------------------

/// Why a single resource could not be replaced or merged.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// The requested resource name is not in the registry.
    #[error("unknown resource `{name}`")]
    UnknownResource {
        /// The name that failed to resolve.
        name: String,
    },

    /// Every permitted ladder rung failed with a lock signal.
    #[error("{} is still locked after {rungs_tried} rung(s)", path.display())]
    LockedResource {
        /// Live path of the resource.
        path: PathBuf,
        /// How many rungs were attempted before giving up.
        rungs_tried: usize,
    },

    /// The snapshot copy of a structured document does not parse.
    #[error("snapshot copy of `{name}` is not a valid document: {detail}")]
    CorruptSnapshot {
        /// Resource name.
        name: String,
        /// Parser message.
        detail: String,
    },

    /// The live structured document does not parse.
    #[error("live document {} is not valid: {detail}", path.display())]
    CorruptLiveDocument {
        /// Live path of the resource.
        path: PathBuf,
        /// Parser message.
        detail: String,
    },

    /// A mediator or privileged operation lacked permission.
    #[error("permission denied while trying to {operation} {}", path.display())]
    PrivilegeDenied {
        /// What was being attempted (e.g. `"take ownership of"`).
        operation: String,
        /// Path the operation targeted.
        path: PathBuf,
    },

    /// An I/O failure unrelated to locking (disk full, invalid path, ...).
    #[error("I/O failure on {}: {source}", path.display())]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl ReplaceError {
    /// Build an [`ReplaceError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The serializable classification recorded in reports.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::UnknownResource { .. } => FailureKind::UnknownResource,
            Self::LockedResource { .. } => FailureKind::LockedResource,
            Self::CorruptSnapshot { .. } => FailureKind::CorruptSnapshot,
            Self::CorruptLiveDocument { .. } => FailureKind::CorruptLiveDocument,
            Self::PrivilegeDenied { .. } => FailureKind::PrivilegeDenied,
            Self::Io { .. } => FailureKind::IoFailure,
        }
    }
}

/// Report-level classification of a [`ReplaceError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownResource,
    LockedResource,
    CorruptSnapshot,
    CorruptLiveDocument,
    PrivilegeDenied,
    IoFailure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UnknownResource => "unknown_resource",
            Self::LockedResource => "locked_resource",
            Self::CorruptSnapshot => "corrupt_snapshot",
            Self::CorruptLiveDocument => "corrupt_live_document",
            Self::PrivilegeDenied => "privilege_denied",
            Self::IoFailure => "io_failure",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// MediatorError
// ---------------------------------------------------------------------------

/// Errors from process-level lock mediation.
#[derive(Debug, Error)]
pub enum MediatorError {
    /// The platform refused the operation (insufficient privilege).
    #[error("not permitted to {action} process {pid}")]
    Denied {
        /// What was attempted (`"suspend"`, `"resume"`, ...).
        action: &'static str,
        /// Target process.
        pid: u32,
    },

    /// The process no longer exists.
    #[error("process {pid} is gone")]
    Gone {
        /// Target process.
        pid: u32,
    },

    /// The operation is not available on this platform.
    #[error("{action} is not supported on this platform")]
    Unsupported {
        /// What was attempted.
        action: &'static str,
    },

    /// A helper command (`kill`, `taskkill`) failed for another reason.
    #[error("`{command}` failed: {stderr}")]
    Command {
        /// The command line that was run.
        command: String,
        /// Captured stderr.
        stderr: String,
    },

    /// Spawning the helper command failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// A configuration file could not be loaded, parsed, or validated.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the file failed.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The TOML did not match the schema.
    #[error("failed to parse {}: {detail}", path.display())]
    Parse {
        /// Path to the configuration file.
        path: PathBuf,
        /// Parser message, including line/column when available.
        detail: String,
    },

    /// The configuration parsed but is inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
