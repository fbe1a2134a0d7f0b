use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::StoreError;
use crate::lock::{LockOp, RangeLock};

pub mod memory;

pub use memory::{MemoryKvs, MAX_FILE_SIZE};

pub type Inode = u64;

/// Well-known inode of every tree's root directory.
pub const ROOT_INODE: Inode = 2;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Caller identity forwarded to the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }

    pub fn current() -> Self {
        Self {
            uid: rustix::process::getuid().as_raw(),
            gid: rustix::process::getgid().as_raw(),
        }
    }
}

/// stat-like metadata kept per tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub ino: Inode,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl Attributes {
    /// Root directory seed: drwxrwxrwx, two links, owned by root, zeroed times.
    pub fn root() -> Self {
        Self {
            ino: ROOT_INODE,
            mode: libc::S_IFDIR as u32 | 0o777,
            nlink: 2,
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
        }
    }

    pub fn regular(ino: Inode, creds: Credentials) -> Self {
        let now = Utc::now().timestamp();
        Self {
            ino,
            mode: libc::S_IFREG as u32 | 0o644,
            nlink: 1,
            uid: creds.uid,
            gid: creds.gid,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }
}

/// Persisted identity of one filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    name: String,
    id: u16,
    fid: Uuid,
}

impl Namespace {
    pub fn new(name: impl Into<String>, id: u16) -> Self {
        Self {
            name: name.into(),
            id,
            fid: Uuid::new_v4(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn fid(&self) -> Uuid {
        self.fid
    }
}

/// Opaque reference to a namespace's persisted tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHandle {
    pub ns_id: u16,
    pub root: Inode,
}

/// Endpoint-facing view of an export record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInfo {
    pub ns_id: u16,
    pub options: String,
}

/// Tenant/export catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    name: String,
    ns_id: u16,
    options: String,
    created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(name: impl Into<String>, ns_id: u16, options: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ns_id,
            options: options.into(),
            created_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> ExportInfo {
        ExportInfo {
            ns_id: self.ns_id,
            options: self.options.clone(),
        }
    }
}

/// Store-level open file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub ns_id: u16,
    pub ino: Inode,
    pub fd: u64,
}

#[async_trait]
pub trait NamespaceStore: Send + Sync {
    async fn create(&self, name: &str) -> StoreResult<Namespace>;
    async fn delete(&self, ns: &Namespace) -> StoreResult<()>;
    async fn scan(&self) -> StoreResult<Vec<Namespace>>;
}

#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Creates the tree for `ns` with a root node carrying `root`.
    async fn create(&self, ns: &Namespace, root: &Attributes) -> StoreResult<TreeHandle>;
    /// Opens the existing tree for `ns`.
    async fn init(&self, ns: &Namespace) -> StoreResult<TreeHandle>;
    async fn fini(&self, tree: &TreeHandle) -> StoreResult<()>;
    async fn delete(&self, tree: TreeHandle) -> StoreResult<()>;
    async fn link(&self, tree: &TreeHandle, parent: Inode, name: &str, child: Inode) -> StoreResult<()>;
    async fn unlink(&self, tree: &TreeHandle, parent: Inode, name: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn create(&self, name: &str, ns_id: u16, options: &str) -> StoreResult<Tenant>;
    async fn delete(&self, tenant: &Tenant) -> StoreResult<()>;
    async fn scan(&self) -> StoreResult<Vec<Tenant>>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn open(&self, creds: &Credentials, tree: &TreeHandle, ino: Inode, mode: u32) -> StoreResult<Descriptor>;
    async fn getattr(&self, creds: &Credentials, tree: &TreeHandle, ino: Inode) -> StoreResult<Attributes>;
    /// Returns up to `len` bytes at `offset`; an empty buffer means end of file.
    async fn read(&self, fd: &Descriptor, offset: u64, len: usize) -> StoreResult<Bytes>;
    async fn write(&self, fd: &Descriptor, offset: u64, data: &[u8]) -> StoreResult<usize>;
    async fn close(&self, fd: Descriptor) -> StoreResult<()>;
    /// Applies a range-lock request. `LockOp::Test` returns the conflicting lock, if any.
    async fn lock(&self, fd: &Descriptor, op: LockOp, req: &RangeLock) -> StoreResult<Option<RangeLock>>;
}

/// The set of external stores the core talks to.
#[derive(Clone)]
pub struct Backends {
    pub namespaces: Arc<dyn NamespaceStore>,
    pub trees: Arc<dyn TreeStore>,
    pub tenants: Arc<dyn TenantStore>,
    pub objects: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

impl Backends {
    pub fn memory(kvs: Arc<MemoryKvs>) -> Self {
        Self {
            namespaces: kvs.clone(),
            trees: kvs.clone(),
            tenants: kvs.clone(),
            objects: kvs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_attributes() {
        let root = Attributes::root();
        assert!(root.is_dir());
        assert_eq!(root.ino, ROOT_INODE);
        assert_eq!(root.nlink, 2);
        assert_eq!(root.mode & 0o777, 0o777);
        assert_eq!((root.uid, root.gid), (0, 0));
        assert_eq!((root.atime, root.mtime, root.ctime), (0, 0, 0));
    }

    #[test]
    fn test_regular_attributes() {
        let attrs = Attributes::regular(10, Credentials { uid: 1000, gid: 100 });
        assert!(!attrs.is_dir());
        assert_eq!(attrs.uid, 1000);
        assert_eq!(attrs.size, 0);
    }

    #[test]
    fn test_tenant_info() {
        let tenant = Tenant::new("fs1", 3, "ro");
        assert_eq!(tenant.name(), "fs1");
        assert_eq!(tenant.info(), ExportInfo { ns_id: 3, options: "ro".to_string() });
    }
}
