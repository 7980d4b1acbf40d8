//! Fatal outcomes of an apply, and the non-fatal teardown record.

use camino::Utf8PathBuf;
use thiserror::Error;

/// A fatal failure of an apply operation. Callers typically receive this
/// wrapped in an [`anyhow::Error`]; use [`exit_code`] to classify it.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The image is missing, unreadable, empty, or decodes to nothing.
    #[error("Invalid image {path}: {reason}")]
    InvalidImage {
        /// The offending image
        path: Utf8PathBuf,
        /// What is wrong with it
        reason: String,
    },
    /// Inconsistent or incomplete arguments, detected before any
    /// system resource is acquired.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    /// No partition of a disk image carries the target filesystem.
    #[error("No root partition found on {device}; observed: {}", .observed.join(", "))]
    RootPartitionNotFound {
        /// The partitioned device that was searched
        device: Utf8PathBuf,
        /// What the search saw, for diagnostics
        observed: Vec<String>,
    },
    /// Mounting the root filesystem or a pseudo-filesystem failed.
    #[error("Failed to mount {what}")]
    MountFailure {
        /// The mount that was attempted
        what: String,
        /// The underlying failure
        #[source]
        source: anyhow::Error,
    },
    /// Checking, shrinking or re-encoding the decoded filesystem failed.
    /// The decoded raw image is left in place for manual recovery.
    #[error("Re-encoding failed; raw image preserved at {raw}")]
    ResizeOrCheckFailure {
        /// The decoded raw image that was kept
        raw: Utf8PathBuf,
        /// The underlying failure
        #[source]
        source: anyhow::Error,
    },
    /// The overlay collaborator exited unsuccessfully.
    #[error("Applying overlay failed")]
    CollaboratorFailure(#[source] anyhow::Error),
    /// A termination signal arrived while the apply was running.
    #[error("Interrupted by {0}")]
    Interrupted(&'static str),
}

impl ApplyError {
    /// Shorthand for [`ApplyError::InvalidImage`].
    pub(crate) fn invalid_image(path: impl Into<Utf8PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidImage {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`ApplyError::MountFailure`].
    pub(crate) fn mount(what: impl Into<String>, source: anyhow::Error) -> Self {
        Self::MountFailure {
            what: what.into(),
            source,
        }
    }

    /// The process exit code this failure maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            ApplyError::InvalidImage { .. } | ApplyError::InvalidArguments(_) => 2,
            ApplyError::RootPartitionNotFound { .. } => 3,
            ApplyError::MountFailure { .. } => 4,
            ApplyError::ResizeOrCheckFailure { .. } => 5,
            ApplyError::CollaboratorFailure(_) => 6,
            ApplyError::Interrupted(_) => 130,
        }
    }
}

/// Exit code for any error returned from the CLI: 1 unless the error
/// chain contains an [`ApplyError`].
pub fn exit_code(e: &anyhow::Error) -> i32 {
    e.chain()
        .find_map(|e| e.downcast_ref::<ApplyError>())
        .map(ApplyError::exit_code)
        .unwrap_or(1)
}

/// A resource that could not be released. Teardown keeps going past
/// these; they are logged and handed back to the caller.
#[derive(Debug)]
pub struct TeardownWarning {
    /// What we tried to release, e.g. a mount point
    pub resource: String,
    /// Why it failed
    pub error: anyhow::Error,
}

impl std::fmt::Display for TeardownWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to release {}: {:#}", self.resource, self.error)
    }
}
