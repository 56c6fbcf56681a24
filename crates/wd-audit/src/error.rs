// error.rs — Error types for the audit subsystem.
//
// Each variant maps to a specific failure mode in the audit pipeline. Callers
// in the gateway treat every one of these as fatal for the request being
// audited: an action that cannot be recorded is not performed.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during audit operations.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Failed to open or create the audit log file.
    #[error("failed to open audit log at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to durably write an event.
    #[error("failed to append event: {0}")]
    WriteFailed(#[from] std::io::Error),

    /// Failed to serialize or deserialize an event (malformed JSON).
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// An earlier write failed; the log accepts nothing until reopened.
    #[error("audit log closed after a failed write ({cause}); reopen to resume")]
    Closed { cause: String },

    /// The hash chain is broken at the given line/sequence.
    #[error("integrity check failed at line {line}: {detail}")]
    IntegrityViolation { line: usize, detail: String },

    /// Another thread panicked while holding the log lock.
    #[error("audit log lock poisoned")]
    Poisoned,
}
