use thiserror::Error;

/// Failure reported by one of the external stores, carrying its native errno.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (errno {code})")]
pub struct StoreError {
    pub code: i32,
    pub message: String,
}

impl StoreError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(libc::ENOENT, message)
    }

    pub fn exists(message: impl Into<String>) -> Self {
        Self::new(libc::EEXIST, message)
    }

    pub fn bad_descriptor(message: impl Into<String>) -> Self {
        Self::new(libc::EBADF, message)
    }

    pub fn would_block(message: impl Into<String>) -> Self {
        Self::new(libc::EAGAIN, message)
    }
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Already exported: {0}")]
    AlreadyExported(String),

    #[error("Not exported: {0}")]
    NotExported(String),

    #[error("Not empty: {0}")]
    NotEmpty(String),

    #[error("Still exported: {0}")]
    StillExported(String),

    #[error("Fault: {0}")]
    Fault(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Store error in {op}: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FsError {
    /// Wraps a store failure verbatim, tagged with the operation that hit it.
    pub fn store(op: &'static str, source: StoreError) -> Self {
        FsError::Store { op, source }
    }

    /// Maps a store failure onto the I/O taxonomy used by the data path.
    pub fn from_store(op: &'static str, source: StoreError) -> Self {
        match source.code {
            libc::ENOENT => FsError::NotFound(format!("{}: {}", op, source.message)),
            libc::EEXIST => FsError::AlreadyExists(format!("{}: {}", op, source.message)),
            libc::EFAULT | libc::EBADF => FsError::Fault(format!("{}: {}", op, source.message)),
            libc::EOPNOTSUPP => FsError::Unsupported(format!("{}: {}", op, source.message)),
            _ => FsError::Store { op, source },
        }
    }

    /// POSIX code for adapters that translate errors onto a wire status.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) | FsError::NotExported(_) => libc::ENOENT,
            FsError::AlreadyExists(_) | FsError::AlreadyExported(_) => libc::EEXIST,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::StillExported(_) => libc::EINVAL,
            FsError::Fault(_) => libc::EFAULT,
            FsError::Unsupported(_) => libc::EOPNOTSUPP,
            FsError::Store { source, .. } => source.code,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            FsError::Serialization(_) => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
