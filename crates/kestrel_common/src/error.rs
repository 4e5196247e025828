use thiserror::Error;

use crate::dn::Dn;

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — bad input, invariant violation, permission denied
/// - `Retryable`   — concurrent-modification conflict; caller SHOULD retry
/// - `Transient`   — backend I/O, resource exhaustion; caller MAY retry after back-off
/// - `InternalBug` — should never happen; triggers an alert + diagnostic log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    /// Internal bug — should never occur in production.
    /// Carries a unique `error_code` and context for post-mortem.
    #[error("InternalBug [{error_code}]: {message}")]
    InternalBug {
        error_code: &'static str,
        message: String,
    },
}

impl KestrelError {
    pub fn internal_bug(error_code: &'static str, message: impl Into<String>) -> Self {
        Self::InternalBug {
            error_code,
            message: message.into(),
        }
    }

    /// Classify for retry/escalation. Commit-stage persistence failures are
    /// the only ambiguous ones; everything validation-shaped is a user error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse(_) => ErrorKind::UserError,
            Self::Store(e) => e.kind(),
            Self::Pipeline(e) => e.kind(),
            Self::Export(e) => e.kind(),
            Self::InternalBug { .. } => ErrorKind::InternalBug,
        }
    }
}

/// Input-parsing errors. Always rejected before any store access.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Malformed DN '{text}': {reason}")]
    MalformedDn { text: String, reason: String },

    #[error("Malformed filter '{text}': {reason}")]
    MalformedFilter { text: String, reason: String },

    #[error("Malformed LDIF at line {line}: {reason}")]
    MalformedLdif { line: usize, reason: String },
}

/// Entry-store invariant violations. The operation aborts cleanly; the store
/// is unchanged unless the variant says otherwise.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No such entry: {0}")]
    NotFound(Dn),

    #[error("Entry already exists: {0}")]
    DuplicateEntry(Dn),

    #[error("Parent entry does not exist: {0}")]
    NoSuchParent(Dn),

    #[error("Entry has children and cannot be removed: {0}")]
    NotLeaf(Dn),

    #[error("Bulk import left {count} orphaned entries (first: {first})")]
    OrphanedEntries { count: usize, first: Dn },

    #[error("Recursive delete is disabled by configuration")]
    RecursiveDeleteDisabled,

    #[error("Cannot move {0} beneath its own subtree")]
    RenameIntoOwnSubtree(Dn),

    /// A compare-and-swap replace lost against a concurrent writer of the
    /// same DN. Classified retryable.
    #[error("Concurrent modification of {0}")]
    ConcurrentModification(Dn),

    #[error("Persistence backend failure: {0}")]
    Persistence(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Persistence(_) => ErrorKind::Transient,
            Self::ConcurrentModification(_) => ErrorKind::Retryable,
            _ => ErrorKind::UserError,
        }
    }
}

/// Operation-pipeline failures surfaced to the caller.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Modification failed: {0}")]
    ModificationFailed(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            _ => ErrorKind::UserError,
        }
    }
}

/// Export/selection-engine failures.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Destination file already exists: {0}")]
    DestinationExists(String),

    #[error("Transform pipeline already finalized; options cannot change after open")]
    PipelineSealed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ldif(#[from] ParseError),
}

impl ExportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Transient,
            _ => ErrorKind::UserError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_maps_persistence_to_transient() {
        let err = KestrelError::from(StoreError::Persistence("disk gone".into()));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn classification_maps_invariants_to_user_error() {
        let dn = Dn::parse("dc=example").unwrap();
        assert_eq!(
            KestrelError::from(StoreError::NotLeaf(dn.clone())).kind(),
            ErrorKind::UserError
        );
        assert_eq!(
            KestrelError::from(StoreError::DuplicateEntry(dn)).kind(),
            ErrorKind::UserError
        );
    }

    #[test]
    fn concurrent_modification_is_retryable() {
        let dn = Dn::parse("ou=people,dc=example").unwrap();
        assert_eq!(
            KestrelError::from(StoreError::ConcurrentModification(dn)).kind(),
            ErrorKind::Retryable
        );
    }
}
