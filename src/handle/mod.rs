use std::sync::Arc;
use bytes::Bytes;
use tracing::{debug, error, trace, warn};
use crate::error::{FsError, Result};
use crate::fs::FsContext;
use crate::lock::{LockMode, LockOp, LockOwner, RangeLock};
use crate::storage::{Attributes, Credentials, Descriptor, Inode};

/// Mode requested from the store for every open.
pub const DEFAULT_OPEN_MODE: u32 = 0o777;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlags {
    Closed,
    Read,
    Write,
    ReadWrite,
}

/// A file inside an opened filesystem.
#[derive(Debug, Clone)]
pub struct FileObject {
    fs: Arc<FsContext>,
    ino: Inode,
}

impl FileObject {
    pub fn new(fs: Arc<FsContext>, ino: Inode) -> Self {
        Self { fs, ino }
    }

    pub fn ino(&self) -> Inode {
        self.ino
    }

    pub fn fs(&self) -> &FsContext {
        &self.fs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLockOp {
    Test,
    Lock,
    Unlock,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
    NoLock,
}

/// Byte range `[start, start + length)`.
///
/// A zero length follows the NFS convention and covers everything from `start`
/// to the end of the file, not an empty range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    pub start: u64,
    pub length: u64,
    pub kind: LockKind,
}

impl LockRequest {
    pub fn new(start: u64, length: u64, kind: LockKind) -> Self {
        Self { start, length, kind }
    }
}

/// A held lock that blocks a tested request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictingLock {
    pub start: u64,
    pub length: u64,
    pub kind: LockKind,
    pub owner: LockOwner,
}

impl From<RangeLock> for ConflictingLock {
    fn from(lock: RangeLock) -> Self {
        Self {
            start: lock.start,
            length: lock.length(),
            kind: match lock.mode {
                LockMode::Read => LockKind::Read,
                LockMode::ReadWrite => LockKind::Write,
            },
            owner: lock.owner,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum HandleState {
    Closed,
    Open { flags: OpenFlags, fd: Descriptor },
}

/// Open/read/write/lock/close state machine for one file.
///
/// `open` and `close` take `&mut self`, so transitions on one handle are
/// serialized by the borrow checker; reads, writes and lock calls share the
/// handle and may run concurrently.
#[derive(Debug)]
pub struct FileHandle {
    object: FileObject,
    state: HandleState,
    creds: Credentials,
    saved_attrs: Option<Attributes>,
}

impl FileHandle {
    pub fn new(object: FileObject) -> Self {
        Self {
            object,
            state: HandleState::Closed,
            creds: Credentials::root(),
            saved_attrs: None,
        }
    }

    pub fn object(&self) -> &FileObject {
        &self.object
    }

    pub fn status(&self) -> OpenFlags {
        match self.state {
            HandleState::Closed => OpenFlags::Closed,
            HandleState::Open { flags, .. } => flags,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, HandleState::Open { .. })
    }

    pub fn descriptor(&self) -> Option<Descriptor> {
        match self.state {
            HandleState::Closed => None,
            HandleState::Open { fd, .. } => Some(fd),
        }
    }

    /// Attributes captured at open. May be stale.
    pub fn attributes(&self) -> Option<&Attributes> {
        self.saved_attrs.as_ref()
    }

    fn open_descriptor(&self, op: &str) -> Result<Descriptor> {
        self.descriptor().ok_or_else(|| {
            error!("{} on closed handle, ino {}", op, self.object.ino);
            FsError::Fault(format!("{} on closed handle", op))
        })
    }

    pub async fn open(&mut self, creds: Credentials, flags: OpenFlags) -> Result<()> {
        if self.is_open() {
            error!("open on already open handle, ino {}", self.object.ino);
            return Err(FsError::Fault("handle already open".to_string()));
        }
        if flags == OpenFlags::Closed {
            return Err(FsError::Fault("open requested with Closed flags".to_string()));
        }

        let ctx = &self.object.fs;
        let store = ctx.objects();
        let fd = store
            .open(&creds, ctx.tree(), self.object.ino, DEFAULT_OPEN_MODE)
            .await
            .map_err(|e| FsError::from_store("open", e))?;

        let attrs = match store.getattr(&creds, ctx.tree(), self.object.ino).await {
            Ok(attrs) => attrs,
            Err(e) => {
                if let Err(close_err) = store.close(fd).await {
                    warn!("releasing descriptor {} after failed getattr: {}", fd.fd, close_err);
                }
                return Err(FsError::from_store("getattr", e));
            }
        };

        self.state = HandleState::Open { flags, fd };
        self.creds = creds;
        self.saved_attrs = Some(attrs);
        debug!("opened fs={} ino={} fd={} flags={:?}", ctx.name(), self.object.ino, fd.fd, flags);
        Ok(())
    }

    /// Reads up to `len` bytes. End of file is reported only by an empty read.
    pub async fn read(&self, offset: u64, len: usize) -> Result<(Bytes, bool)> {
        let fd = self.open_descriptor("read")?;
        let data = self
            .object
            .fs
            .objects()
            .read(&fd, offset, len)
            .await
            .map_err(|e| FsError::from_store("read", e))?;
        let end_of_file = data.is_empty();
        Ok((data, end_of_file))
    }

    /// Writes `buf` at `offset`. The data is never reported as stable.
    pub async fn write(&self, offset: u64, buf: &[u8]) -> Result<(usize, bool)> {
        let fd = self.open_descriptor("write")?;
        let written = self
            .object
            .fs
            .objects()
            .write(&fd, offset, buf)
            .await
            .map_err(|e| FsError::from_store("write", e))?;
        Ok((written, false))
    }

    /// Accepted without flushing anything; writes are not made durable here.
    pub async fn commit(&self, offset: u64, len: u64) -> Result<()> {
        trace!("commit ino={} offset={} len={} (no-op)", self.object.ino, offset, len);
        Ok(())
    }

    /// Releases the descriptor. The handle ends up closed even if the release fails.
    pub async fn close(&mut self) -> Result<()> {
        let HandleState::Open { fd, .. } = std::mem::replace(&mut self.state, HandleState::Closed) else {
            return Ok(());
        };
        self.saved_attrs = None;

        self.object.fs.objects().close(fd).await.map_err(|e| {
            warn!("close of fd {} on ino {} failed: {}", fd.fd, self.object.ino, e);
            FsError::from_store("close", e)
        })
    }

    /// Tests, takes or releases a byte-range lock for `owner`.
    ///
    /// A conflict found by `FileLockOp::Test` is returned as data, not as an error.
    pub async fn lock(
        &self,
        op: FileLockOp,
        request: LockRequest,
        owner: LockOwner,
    ) -> Result<Option<ConflictingLock>> {
        let Some(fd) = self.descriptor() else {
            debug!("Attempting to lock with no file descriptor open, ino {}", self.object.ino);
            return Err(FsError::Fault("lock without an open descriptor".to_string()));
        };

        let store_op = match op {
            FileLockOp::Test => LockOp::Test,
            FileLockOp::Lock => LockOp::Lock,
            FileLockOp::Unlock => LockOp::Unlock,
            FileLockOp::Cancel => {
                debug!("Unsupported lock operation {:?}", op);
                return Err(FsError::Unsupported(format!("lock operation {:?}", op)));
            }
        };

        let mode = match request.kind {
            LockKind::Read => LockMode::Read,
            LockKind::Write => LockMode::ReadWrite,
            LockKind::NoLock => {
                debug!("The requested lock type was not read or write.");
                return Err(FsError::Unsupported("lock type must be read or write".to_string()));
            }
        };

        let range = RangeLock::new(request.start, request.length, mode, owner);
        let conflict = self
            .object
            .fs
            .objects()
            .lock(&fd, store_op, &range)
            .await
            .map_err(|e| FsError::from_store("lock", e))?;

        trace!(
            "Locking: op:{:?} type:{:?} start:{} length:{} owner:{}",
            op, request.kind, request.start, request.length, owner.0
        );

        if store_op == LockOp::Test {
            Ok(conflict.map(ConflictingLock::from))
        } else {
            Ok(None)
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if let HandleState::Open { fd, .. } = self.state {
            warn!("file handle for ino {} dropped while open, fd {} leaked", self.object.ino, fd.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FsManager;
    use crate::storage::{Backends, MemoryKvs, ObjectStore, ROOT_INODE};

    async fn setup() -> (Arc<MemoryKvs>, FileHandle) {
        let kvs = Arc::new(MemoryKvs::new());
        let mgr = FsManager::new(Backends::memory(kvs.clone()));
        mgr.create_filesystem("fs1").await.unwrap();
        let ctx = mgr.open_filesystem("fs1").await.unwrap();
        let ino = kvs
            .create_object(&Credentials::root(), ctx.tree(), ROOT_INODE, "file")
            .await
            .unwrap();
        (kvs, FileHandle::new(FileObject::new(ctx, ino)))
    }

    async fn open_handle() -> (Arc<MemoryKvs>, FileHandle) {
        let (kvs, mut handle) = setup().await;
        handle.open(Credentials::root(), OpenFlags::ReadWrite).await.unwrap();
        (kvs, handle)
    }

    #[tokio::test]
    async fn test_open_close_transitions() {
        let (kvs, mut handle) = setup().await;
        assert_eq!(handle.status(), OpenFlags::Closed);
        assert!(handle.attributes().is_none());

        handle.open(Credentials::root(), OpenFlags::Read).await.unwrap();
        assert_eq!(handle.status(), OpenFlags::Read);
        assert_eq!(handle.attributes().unwrap().ino, handle.object().ino());
        assert_eq!(kvs.open_descriptors().await, 1);

        handle.close().await.unwrap();
        assert_eq!(handle.status(), OpenFlags::Closed);
        assert_eq!(kvs.open_descriptors().await, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_kvs, mut handle) = open_handle().await;
        handle.close().await.unwrap();
        handle.close().await.unwrap();
        handle.close().await.unwrap();
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_reopen_is_fault() {
        let (kvs, mut handle) = open_handle().await;
        let fd = handle.descriptor().unwrap();

        assert!(matches!(handle.open(Credentials::root(), OpenFlags::Read).await, Err(FsError::Fault(_))));
        assert_eq!(handle.descriptor(), Some(fd));
        assert_eq!(handle.status(), OpenFlags::ReadWrite);
        assert_eq!(kvs.open_descriptors().await, 1);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_with_closed_flags() {
        let (_kvs, mut handle) = setup().await;
        assert!(matches!(handle.open(Credentials::root(), OpenFlags::Closed).await, Err(FsError::Fault(_))));
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_open_failure_stays_closed() {
        let (_kvs, handle) = setup().await;
        let ctx = handle.object().fs.clone();
        let mut missing = FileHandle::new(FileObject::new(ctx.clone(), 4242));
        assert!(matches!(
            missing.open(Credentials::root(), OpenFlags::ReadWrite).await,
            Err(FsError::NotFound(_))
        ));
        assert_eq!(missing.status(), OpenFlags::Closed);

        let mut dir = FileHandle::new(FileObject::new(ctx, ROOT_INODE));
        assert!(matches!(
            dir.open(Credentials::root(), OpenFlags::ReadWrite).await,
            Err(FsError::Store { op: "open", .. })
        ));
        assert!(!dir.is_open());
    }

    #[tokio::test]
    async fn test_read_empty_file_is_eof() {
        let (_kvs, mut handle) = open_handle().await;
        let (data, eof) = handle.read(0, 4096).await.unwrap();
        assert!(data.is_empty());
        assert!(eof);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_short_read_is_not_eof() {
        let (_kvs, mut handle) = open_handle().await;
        let (written, stable) = handle.write(0, b"hello").await.unwrap();
        assert_eq!(written, 5);
        assert!(!stable);

        let (data, eof) = handle.read(0, 10).await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert!(!eof);

        let (data, eof) = handle.read(5, 10).await.unwrap();
        assert!(data.is_empty());
        assert!(eof);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_reads() {
        let (_kvs, mut handle) = open_handle().await;
        handle.write(0, b"0123456789").await.unwrap();

        let (left, right) = tokio::join!(handle.read(0, 5), handle.read(5, 5));
        assert_eq!(&left.unwrap().0[..], b"01234");
        assert_eq!(&right.unwrap().0[..], b"56789");
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_io_on_closed_handle() {
        let (_kvs, handle) = setup().await;
        assert!(matches!(handle.read(0, 1).await, Err(FsError::Fault(_))));
        assert!(matches!(handle.write(0, b"x").await, Err(FsError::Fault(_))));
    }

    #[tokio::test]
    async fn test_write_beyond_max_size_fails() {
        let (kvs, mut handle) = open_handle().await;
        let err = handle.write(1u64 << 63, b"x").await.unwrap_err();
        assert!(matches!(err, FsError::Store { op: "write", ref source } if source.code == libc::EFBIG));
        assert_eq!(err.errno(), libc::EFBIG);

        let ctx = handle.object().fs();
        let attrs = kvs.getattr(&Credentials::root(), ctx.tree(), handle.object().ino()).await.unwrap();
        assert_eq!(attrs.size, 0);
        assert!(handle.is_open());
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cached_attributes_go_stale() {
        let (kvs, mut handle) = open_handle().await;
        handle.write(0, b"grow").await.unwrap();

        assert_eq!(handle.attributes().unwrap().size, 0);
        let ctx = handle.object().fs();
        let fresh = kvs.getattr(&Credentials::root(), ctx.tree(), handle.object().ino()).await.unwrap();
        assert_eq!(fresh.size, 4);
        handle.close().await.unwrap();
    }

    // Known gap: commit performs no flush, so success says nothing about durability.
    #[tokio::test]
    async fn test_commit_is_passthrough() {
        let (_kvs, mut handle) = open_handle().await;
        handle.write(0, b"data").await.unwrap();
        handle.commit(0, 4).await.unwrap();
        handle.close().await.unwrap();
        handle.commit(0, 4).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_completes_when_release_fails() {
        let (kvs, mut handle) = open_handle().await;
        let fd = handle.descriptor().unwrap();
        kvs.close(fd).await.unwrap();

        assert!(matches!(handle.close().await, Err(FsError::Fault(_))));
        assert_eq!(handle.status(), OpenFlags::Closed);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_round_trip() {
        let (_kvs, mut handle) = open_handle().await;
        let a = LockOwner(1);
        let b = LockOwner(2);

        let held = handle
            .lock(FileLockOp::Lock, LockRequest::new(0, 100, LockKind::Write), a)
            .await
            .unwrap();
        assert!(held.is_none());

        let conflict = handle
            .lock(FileLockOp::Test, LockRequest::new(50, 100, LockKind::Read), b)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conflict.owner, a);
        assert!(conflict.start < 100 && conflict.start + conflict.length > 50);
        assert_eq!(conflict.kind, LockKind::Write);

        handle
            .lock(FileLockOp::Unlock, LockRequest::new(0, 100, LockKind::Write), a)
            .await
            .unwrap();
        let conflict = handle
            .lock(FileLockOp::Test, LockRequest::new(50, 100, LockKind::Read), b)
            .await
            .unwrap();
        assert!(conflict.is_none());
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_test_does_not_mutate() {
        let (kvs, mut handle) = open_handle().await;
        let ino = handle.object().ino();
        let ns_id = handle.object().fs().namespace().id();

        let conflict = handle
            .lock(FileLockOp::Test, LockRequest::new(0, 10, LockKind::Write), LockOwner(1))
            .await
            .unwrap();
        assert!(conflict.is_none());
        assert!(kvs.held_locks(ns_id, ino).await.is_empty());
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_conflicting_lock_fails() {
        let (_kvs, mut handle) = open_handle().await;
        handle
            .lock(FileLockOp::Lock, LockRequest::new(0, 10, LockKind::Write), LockOwner(1))
            .await
            .unwrap();

        match handle
            .lock(FileLockOp::Lock, LockRequest::new(5, 10, LockKind::Read), LockOwner(2))
            .await
        {
            Err(FsError::Store { op, source }) => {
                assert_eq!(op, "lock");
                assert_eq!(source.code, libc::EAGAIN);
            }
            other => panic!("expected Store, got {:?}", other),
        }
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_preconditions() {
        let (_kvs, mut handle) = setup().await;
        let req = LockRequest::new(0, 10, LockKind::Read);
        assert!(matches!(
            handle.lock(FileLockOp::Lock, req, LockOwner(1)).await,
            Err(FsError::Fault(_))
        ));

        handle.open(Credentials::root(), OpenFlags::ReadWrite).await.unwrap();
        assert!(matches!(
            handle.lock(FileLockOp::Cancel, req, LockOwner(1)).await,
            Err(FsError::Unsupported(_))
        ));
        assert!(matches!(
            handle
                .lock(FileLockOp::Lock, LockRequest::new(0, 10, LockKind::NoLock), LockOwner(1))
                .await,
            Err(FsError::Unsupported(_))
        ));
        handle.close().await.unwrap();
    }
}
