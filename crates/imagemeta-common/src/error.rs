//! Error taxonomy for the imagemeta engine.
//!
//! Two layers of failure exist. `Error` is the typed error every component
//! returns; session-level faults abort a whole scan. `ScanStatus` is the
//! per-image terminal outcome the orchestrator reports: one image failing
//! never removes or blocks results for another.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common result type for imagemeta operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed error for engine components.
#[derive(Debug, Error)]
pub enum Error {
    /// Pool or transport unreachable. Session fault: aborts the whole call.
    #[error("pool unreachable: {0}")]
    Unreachable(String),

    /// Access denied by the cluster.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A named object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// A metadata fragment failed structural validation.
    #[error("corrupt metadata in {object}: {detail}")]
    CorruptMetadata { object: String, detail: String },

    /// The scan was cancelled by the caller.
    #[error("scan cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Create a corrupt-metadata error.
    pub fn corrupt(object: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::CorruptMetadata {
            object: object.into(),
            detail: detail.into(),
        }
    }

    /// True if this fault invalidates the whole session, not just one image.
    #[must_use]
    pub fn is_session_fault(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Cancelled)
    }
}

/// Terminal per-image outcome of a scan.
///
/// `code()` yields the errno-style value callers receive next to each
/// record: zero for success, negative otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Ok,
    NotFound,
    PermissionDenied,
    CorruptMetadata,
    /// Record returned but one or more derived fields (usage) could not be
    /// computed from consistent data.
    Incomplete,
}

impl ScanStatus {
    /// Errno-style status code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::NotFound => -2,
            Self::Incomplete => -5,
            Self::PermissionDenied => -13,
            Self::CorruptMetadata => -22,
        }
    }

    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Map a per-image error to its terminal status.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::NotFound(_) => Self::NotFound,
            Error::PermissionDenied(_) => Self::PermissionDenied,
            Error::CorruptMetadata { .. } => Self::CorruptMetadata,
            _ => Self::Incomplete,
        }
    }
}
