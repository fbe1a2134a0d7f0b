pub mod config;
pub mod error;
pub mod fs;
pub mod handle;
pub mod lock;
pub mod storage;

pub use config::CoreConfig;
pub use error::{FsError, Result, StoreError};
pub use fs::{ExportHook, FilesystemHandle, FsContext, FsManager, ListEntry};
pub use handle::{ConflictingLock, FileHandle, FileLockOp, FileObject, LockKind, LockRequest, OpenFlags};
pub use lock::{LockMode, LockOwner, RangeLock, RangeLockTable};
pub use storage::{Backends, Credentials, MemoryKvs};
