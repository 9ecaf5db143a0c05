use thiserror::Error;

/// Boundary error vocabulary: every fallible core operation resolves to
/// one of these, or to `Internal` for an invariant violation that should
/// never actually trigger (a bug, not a clean outcome).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("read error")]
    ReadError,

    #[error("write error")]
    WriteError,

    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no such entry")]
    NoSuchEntry,

    #[error("already exists")]
    AlreadyExists,

    #[error("is a directory")]
    IsDirectory,

    #[error("is not a directory")]
    IsNotDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("filesystem is read-only")]
    ReadOnlyFs,

    #[error("invalid seek")]
    InvalidSeek,

    #[error("already in use")]
    AlreadyInUse,

    /// An invariant that core algorithms assume can never fail in
    /// practice (a full split producing too many branches, a remove
    /// finding neither sibling mergeable, ...). Surfacing it as a
    /// `FsError` rather than panicking lets callers still roll back
    /// cleanly and lets tests assert it never happens.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl FsError {
    /// Transient storage errors are retried nowhere; the originating
    /// operation rolls back its own session and rethrows. Logical errors
    /// are clean, non-transactional outcomes.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FsError::ReadError | FsError::WriteError | FsError::OutOfMemory
        )
    }
}

pub type FsResult<T> = Result<T, FsError>;
