use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use crate::error::{Result, StoreError};
use crate::lock::{LockOp, RangeLock, RangeLockTable};
use super::{
    Attributes, Credentials, Descriptor, Inode, Namespace, NamespaceStore, ObjectStore,
    StoreResult, Tenant, TenantStore, TreeHandle, TreeStore,
};

#[derive(Debug, Serialize, Deserialize)]
struct Node {
    attrs: Attributes,
    #[serde(default)]
    children: BTreeMap<String, Inode>,
    #[serde(default)]
    data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TreeState {
    nodes: HashMap<Inode, Node>,
    next_ino: Inode,
}

impl TreeState {
    fn node(&self, ino: Inode) -> StoreResult<&Node> {
        self.nodes
            .get(&ino)
            .ok_or_else(|| StoreError::not_found(format!("inode {} not found", ino)))
    }

    fn node_mut(&mut self, ino: Inode) -> StoreResult<&mut Node> {
        self.nodes
            .get_mut(&ino)
            .ok_or_else(|| StoreError::not_found(format!("inode {} not found", ino)))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KvsState {
    namespaces: BTreeMap<String, Namespace>,
    next_ns_id: u16,
    trees: HashMap<u16, TreeState>,
    tenants: BTreeMap<String, Tenant>,
}

impl KvsState {
    fn tree(&self, ns_id: u16) -> StoreResult<&TreeState> {
        self.trees
            .get(&ns_id)
            .ok_or_else(|| StoreError::not_found(format!("no tree for namespace {}", ns_id)))
    }

    fn tree_mut(&mut self, ns_id: u16) -> StoreResult<&mut TreeState> {
        self.trees
            .get_mut(&ns_id)
            .ok_or_else(|| StoreError::not_found(format!("no tree for namespace {}", ns_id)))
    }
}

/// Largest object the in-process store will hold; writes ending past it fail with `EFBIG`.
pub const MAX_FILE_SIZE: u64 = 1 << 32;

/// In-process implementation of every store the core consumes.
///
/// Namespaces, trees, object data and tenants can be snapshotted to a JSON
/// file; open descriptors and range locks live only as long as the process.
pub struct MemoryKvs {
    state: RwLock<KvsState>,
    descriptors: Mutex<HashSet<Descriptor>>,
    locks: Mutex<RangeLockTable>,
    next_fd: AtomicU64,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for MemoryKvs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKvs")
            .field("path", &self.path)
            .field("next_fd", &self.next_fd.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MemoryKvs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvs {
    pub fn new() -> Self {
        Self::with_state(KvsState::default(), None)
    }

    fn with_state(state: KvsState, path: Option<PathBuf>) -> Self {
        Self {
            state: RwLock::new(state),
            descriptors: Mutex::new(HashSet::new()),
            locks: Mutex::new(RangeLockTable::new()),
            next_fd: AtomicU64::new(1),
            path,
        }
    }

    /// Loads the snapshot at `path`, or starts empty if there is none yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if tokio::fs::try_exists(&path).await? {
            let raw = tokio::fs::read(&path).await?;
            let state: KvsState = serde_json::from_slice(&raw)?;
            info!("loaded store snapshot {:?}: {} namespaces, {} tenants",
                  path, state.namespaces.len(), state.tenants.len());
            state
        } else {
            debug!("no store snapshot at {:?}, starting empty", path);
            KvsState::default()
        };
        Ok(Self::with_state(state, Some(path)))
    }

    /// Writes the snapshot back to the path given to [`MemoryKvs::open`].
    pub async fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let raw = {
            let state = self.state.read().await;
            serde_json::to_vec_pretty(&*state)?
        };
        tokio::fs::write(path, raw).await?;
        debug!("persisted store snapshot to {:?}", path);
        Ok(())
    }

    /// Creates an empty regular file named `name` under `parent`.
    pub async fn create_object(
        &self,
        creds: &Credentials,
        tree: &TreeHandle,
        parent: Inode,
        name: &str,
    ) -> StoreResult<Inode> {
        let mut state = self.state.write().await;
        let tree_state = state.tree_mut(tree.ns_id)?;

        let parent_node = tree_state.node(parent)?;
        if !parent_node.attrs.is_dir() {
            return Err(StoreError::new(libc::ENOTDIR, format!("inode {} is not a directory", parent)));
        }
        if parent_node.children.contains_key(name) {
            return Err(StoreError::exists(format!("{} already exists", name)));
        }

        let ino = tree_state.next_ino;
        tree_state.next_ino += 1;
        tree_state.nodes.insert(ino, Node {
            attrs: Attributes::regular(ino, *creds),
            children: BTreeMap::new(),
            data: Vec::new(),
        });
        tree_state.node_mut(parent)?.children.insert(name.to_string(), ino);

        debug!("create_object: ns={} parent={} name={} ino={}", tree.ns_id, parent, name, ino);
        Ok(ino)
    }

    /// Child inode of `parent` named `name`.
    pub async fn lookup(&self, tree: &TreeHandle, parent: Inode, name: &str) -> StoreResult<Inode> {
        let state = self.state.read().await;
        state
            .tree(tree.ns_id)?
            .node(parent)?
            .children
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::not_found(format!("{} not found", name)))
    }

    pub async fn open_descriptors(&self) -> usize {
        self.descriptors.lock().await.len()
    }

    pub async fn held_locks(&self, ns_id: u16, ino: Inode) -> Vec<RangeLock> {
        self.locks.lock().await.held((ns_id, ino))
    }

    async fn check_descriptor(&self, fd: &Descriptor) -> StoreResult<()> {
        if self.descriptors.lock().await.contains(fd) {
            Ok(())
        } else {
            Err(StoreError::bad_descriptor(format!("descriptor {} is not open", fd.fd)))
        }
    }
}

#[async_trait]
impl NamespaceStore for MemoryKvs {
    async fn create(&self, name: &str) -> StoreResult<Namespace> {
        let mut state = self.state.write().await;
        if state.namespaces.contains_key(name) {
            return Err(StoreError::exists(format!("namespace {} exists", name)));
        }
        let id = state
            .next_ns_id
            .checked_add(1)
            .ok_or_else(|| StoreError::new(libc::ENOSPC, "namespace ids exhausted"))?;
        state.next_ns_id = id;

        let ns = Namespace::new(name, id);
        state.namespaces.insert(name.to_string(), ns.clone());
        debug!("ns_create: name={} id={} fid={}", name, id, ns.fid());
        Ok(ns)
    }

    async fn delete(&self, ns: &Namespace) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .namespaces
            .remove(ns.name())
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(format!("namespace {} not found", ns.name())))
    }

    async fn scan(&self) -> StoreResult<Vec<Namespace>> {
        let state = self.state.read().await;
        Ok(state.namespaces.values().cloned().collect())
    }
}

#[async_trait]
impl TreeStore for MemoryKvs {
    async fn create(&self, ns: &Namespace, root: &Attributes) -> StoreResult<TreeHandle> {
        let mut state = self.state.write().await;
        if state.trees.contains_key(&ns.id()) {
            return Err(StoreError::exists(format!("tree for namespace {} exists", ns.id())));
        }

        let mut nodes = HashMap::new();
        nodes.insert(root.ino, Node {
            attrs: *root,
            children: BTreeMap::new(),
            data: Vec::new(),
        });
        state.trees.insert(ns.id(), TreeState {
            nodes,
            next_ino: root.ino + 1,
        });

        Ok(TreeHandle { ns_id: ns.id(), root: root.ino })
    }

    async fn init(&self, ns: &Namespace) -> StoreResult<TreeHandle> {
        let state = self.state.read().await;
        let tree = state.tree(ns.id())?;
        let root = tree
            .nodes
            .values()
            .map(|n| n.attrs.ino)
            .min()
            .ok_or_else(|| StoreError::not_found(format!("tree {} has no root", ns.id())))?;
        Ok(TreeHandle { ns_id: ns.id(), root })
    }

    async fn fini(&self, _tree: &TreeHandle) -> StoreResult<()> {
        Ok(())
    }

    async fn delete(&self, tree: TreeHandle) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .trees
            .remove(&tree.ns_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(format!("no tree for namespace {}", tree.ns_id)))
    }

    async fn link(&self, tree: &TreeHandle, parent: Inode, name: &str, child: Inode) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let tree_state = state.tree_mut(tree.ns_id)?;
        tree_state.node(child)?;

        let parent_node = tree_state.node_mut(parent)?;
        if !parent_node.attrs.is_dir() {
            return Err(StoreError::new(libc::ENOTDIR, format!("inode {} is not a directory", parent)));
        }
        if parent_node.children.contains_key(name) {
            return Err(StoreError::exists(format!("{} already linked under {}", name, parent)));
        }
        parent_node.children.insert(name.to_string(), child);
        Ok(())
    }

    async fn unlink(&self, tree: &TreeHandle, parent: Inode, name: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .tree_mut(tree.ns_id)?
            .node_mut(parent)?
            .children
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(format!("{} not linked under {}", name, parent)))
    }
}

#[async_trait]
impl TenantStore for MemoryKvs {
    async fn create(&self, name: &str, ns_id: u16, options: &str) -> StoreResult<Tenant> {
        let mut state = self.state.write().await;
        if state.tenants.contains_key(name) {
            return Err(StoreError::exists(format!("tenant {} exists", name)));
        }
        let tenant = Tenant::new(name, ns_id, options);
        state.tenants.insert(name.to_string(), tenant.clone());
        Ok(tenant)
    }

    async fn delete(&self, tenant: &Tenant) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .tenants
            .remove(tenant.name())
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(format!("tenant {} not found", tenant.name())))
    }

    async fn scan(&self) -> StoreResult<Vec<Tenant>> {
        let state = self.state.read().await;
        Ok(state.tenants.values().cloned().collect())
    }
}

#[async_trait]
impl ObjectStore for MemoryKvs {
    async fn open(&self, creds: &Credentials, tree: &TreeHandle, ino: Inode, mode: u32) -> StoreResult<Descriptor> {
        {
            let state = self.state.read().await;
            let node = state.tree(tree.ns_id)?.node(ino)?;
            if node.attrs.is_dir() {
                return Err(StoreError::new(libc::EISDIR, format!("inode {} is a directory", ino)));
            }
        }

        let fd = Descriptor {
            ns_id: tree.ns_id,
            ino,
            fd: self.next_fd.fetch_add(1, Ordering::Relaxed),
        };
        self.descriptors.lock().await.insert(fd);
        debug!("open: ns={} ino={} fd={} uid={} mode={:o}", tree.ns_id, ino, fd.fd, creds.uid, mode);
        Ok(fd)
    }

    async fn getattr(&self, _creds: &Credentials, tree: &TreeHandle, ino: Inode) -> StoreResult<Attributes> {
        let state = self.state.read().await;
        Ok(state.tree(tree.ns_id)?.node(ino)?.attrs)
    }

    async fn read(&self, fd: &Descriptor, offset: u64, len: usize) -> StoreResult<Bytes> {
        self.check_descriptor(fd).await?;
        let state = self.state.read().await;
        let data = &state.tree(fd.ns_id)?.node(fd.ino)?.data;

        let start = match usize::try_from(offset) {
            Ok(start) if start < data.len() => start,
            _ => return Ok(Bytes::new()),
        };
        let end = start.saturating_add(len).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn write(&self, fd: &Descriptor, offset: u64, data: &[u8]) -> StoreResult<usize> {
        self.check_descriptor(fd).await?;
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= MAX_FILE_SIZE)
            .ok_or_else(|| StoreError::new(
                libc::EFBIG,
                format!("write of {} bytes at {} exceeds {} bytes", data.len(), offset, MAX_FILE_SIZE),
            ))?;
        let (start, end) = (offset as usize, end as usize);

        let mut state = self.state.write().await;
        let node = state.tree_mut(fd.ns_id)?.node_mut(fd.ino)?;
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[start..end].copy_from_slice(data);

        let now = Utc::now().timestamp();
        node.attrs.size = node.data.len() as u64;
        node.attrs.mtime = now;
        node.attrs.ctime = now;
        Ok(data.len())
    }

    async fn close(&self, fd: Descriptor) -> StoreResult<()> {
        if self.descriptors.lock().await.remove(&fd) {
            debug!("close: ns={} ino={} fd={}", fd.ns_id, fd.ino, fd.fd);
            Ok(())
        } else {
            Err(StoreError::bad_descriptor(format!("descriptor {} is not open", fd.fd)))
        }
    }

    async fn lock(&self, fd: &Descriptor, op: LockOp, req: &RangeLock) -> StoreResult<Option<RangeLock>> {
        self.check_descriptor(fd).await?;
        self.locks.lock().await.apply((fd.ns_id, fd.ino), op, req)
    }
}
