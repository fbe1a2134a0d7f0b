use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use crate::error::{FsError, Result};
use crate::storage::{
    Attributes, Backends, ExportInfo, Namespace, ObjectStore, Tenant, TreeHandle,
};

pub mod registry;

pub use registry::{FilesystemRecord, ListEntry, Registry};

/// Protocol-side activation of exports (e.g. rewriting an NFS server's export table).
#[async_trait]
pub trait ExportHook: Send + Sync {
    async fn on_create_export(&self, name: &str, ns_id: u16, options: &str) -> Result<()>;
    async fn on_delete_export(&self, name: &str, ns_id: u16, info: &ExportInfo) -> Result<()>;
}

/// Snapshot of a registry record handed out by lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemHandle {
    namespace: Namespace,
    export: Option<ExportInfo>,
}

impl FilesystemHandle {
    pub fn name(&self) -> &str {
        self.namespace.name()
    }

    pub fn id(&self) -> u16 {
        self.namespace.id()
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn export(&self) -> Option<&ExportInfo> {
        self.export.as_ref()
    }
}

/// Everything the data path needs to reach one filesystem's objects.
pub struct FsContext {
    namespace: Namespace,
    tree: TreeHandle,
    objects: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for FsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsContext")
            .field("namespace", &self.namespace)
            .field("tree", &self.tree)
            .finish()
    }
}

impl FsContext {
    pub fn new(namespace: Namespace, tree: TreeHandle, objects: Arc<dyn ObjectStore>) -> Self {
        Self { namespace, tree, objects }
    }

    pub fn name(&self) -> &str {
        self.namespace.name()
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn tree(&self) -> &TreeHandle {
        &self.tree
    }

    pub(crate) fn objects(&self) -> &dyn ObjectStore {
        self.objects.as_ref()
    }
}

fn rc_of(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => -e.errno(),
    }
}

/// Creates, exports and destroys filesystems, keeping the registry in step
/// with the namespace, tree and tenant stores.
///
/// Every mutating operation runs with the registry mutex held, so the
/// lookup-then-insert of `create_filesystem` cannot race with another create
/// or delete. The multi-store sequences are not transactional: a failure
/// part way leaves the earlier steps in place.
pub struct FsManager {
    backends: Backends,
    hook: Option<Arc<dyn ExportHook>>,
    registry: Mutex<Registry>,
}

impl std::fmt::Debug for FsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsManager")
            .field("backends", &self.backends)
            .field("has_export_hook", &self.hook.is_some())
            .finish()
    }
}

impl FsManager {
    pub fn new(backends: Backends) -> Self {
        Self {
            backends,
            hook: None,
            registry: Mutex::new(Registry::new()),
        }
    }

    pub fn with_export_hook(mut self, hook: Arc<dyn ExportHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Fills the registry from a full namespace scan. Returns the number of records added.
    pub async fn init(&self) -> Result<usize> {
        let namespaces = self
            .backends
            .namespaces
            .scan()
            .await
            .map_err(|e| FsError::store("ns_scan", e))?;
        let found = namespaces.len();
        let added = self.registry.lock().await.populate(namespaces);
        info!("filesystem initialization: {} namespaces, {} registered", found, added);
        Ok(added)
    }

    /// Binds every tenant in the catalog to its filesystem.
    pub async fn init_exports(&self) -> Result<usize> {
        let tenants = self
            .backends
            .tenants
            .scan()
            .await
            .map_err(|e| FsError::store("tenant_scan", e))?;
        let bound = self.reconcile_exports(tenants).await;
        info!("endpoint initialization: {} exports bound", bound);
        Ok(bound)
    }

    /// Attaches catalog entries to records by name. Entries without a
    /// filesystem are an integrity fault: logged and skipped.
    pub async fn reconcile_exports(&self, tenants: Vec<Tenant>) -> usize {
        let mut registry = self.registry.lock().await;
        let mut bound = 0;
        for tenant in tenants {
            match registry.lookup_mut(tenant.name()) {
                Some(record) => {
                    record.export = Some(tenant);
                    bound += 1;
                }
                None => {
                    error!("Tenant list and FS list is not consistent: no filesystem for export {}",
                           tenant.name());
                }
            }
        }
        bound
    }

    /// Detaches all export bindings; the catalog is left as is.
    pub async fn shutdown_exports(&self) {
        self.registry.lock().await.clear_exports();
        info!("endpoint finalize");
    }

    /// Drops every record, finalizing any tree handle it still holds.
    pub async fn teardown(&self) {
        self.shutdown_exports().await;

        let mut registry = self.registry.lock().await;
        for record in registry.iter() {
            if let Some(tree) = record.tree() {
                if let Err(e) = self.backends.trees.fini(tree).await {
                    warn!("tree finalize failed for {}: {}", record.name(), e);
                }
            }
        }
        let released = registry.len();
        registry.clear();
        info!("filesystem finalize: {} records released", released);
    }

    pub async fn lookup_filesystem(&self, name: &str) -> Result<FilesystemHandle> {
        let registry = self.registry.lock().await;
        registry
            .lookup(name)
            .map(|record| FilesystemHandle {
                namespace: record.namespace().clone(),
                export: record.export_info(),
            })
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    /// Visits every filesystem in registry order; the first visitor error ends the scan.
    pub async fn scan_filesystems<F>(&self, visit: F) -> Result<()>
    where
        F: FnMut(&ListEntry) -> Result<()>,
    {
        self.registry.lock().await.scan(visit)
    }

    pub async fn list_filesystems(&self) -> Vec<ListEntry> {
        self.registry.lock().await.entries().collect()
    }

    pub async fn export_info(&self, name: &str) -> Result<ExportInfo> {
        let registry = self.registry.lock().await;
        let record = registry
            .lookup(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        record
            .export_info()
            .ok_or_else(|| FsError::NotExported(name.to_string()))
    }

    pub async fn create_filesystem(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let result = self.create_locked(&mut registry, name).await;
        info!("create_filesystem fs_name={} rc={}", name, rc_of(&result));
        result
    }

    async fn create_locked(&self, registry: &mut Registry, name: &str) -> Result<()> {
        if registry.lookup(name).is_some() {
            error!("{} already exists", name);
            return Err(FsError::AlreadyExists(name.to_string()));
        }

        let ns = self
            .backends
            .namespaces
            .create(name)
            .await
            .map_err(|e| FsError::store("ns_create", e))?;
        let mut record = FilesystemRecord::new(ns);

        // Namespace (and, below, tree) state is left behind if a later step fails.
        let tree = self
            .backends
            .trees
            .create(record.namespace(), &Attributes::root())
            .await
            .map_err(|e| {
                warn!("tree create failed for {}, namespace {} left in store",
                      name, record.namespace().id());
                FsError::store("tree_create", e)
            })?;
        record.tree = Some(tree);

        self.create_root(&tree).await?;

        registry.insert(record);
        Ok(())
    }

    async fn create_root(&self, tree: &TreeHandle) -> Result<()> {
        let trees = &self.backends.trees;
        trees
            .link(tree, tree.root, ".", tree.root)
            .await
            .map_err(|e| FsError::store("tree_create_root", e))?;
        trees
            .link(tree, tree.root, "..", tree.root)
            .await
            .map_err(|e| FsError::store("tree_create_root", e))
    }

    async fn delete_root(&self, tree: &TreeHandle) -> Result<()> {
        let trees = &self.backends.trees;
        trees
            .unlink(tree, tree.root, "..")
            .await
            .map_err(|e| FsError::store("tree_delete_root", e))?;
        trees
            .unlink(tree, tree.root, ".")
            .await
            .map_err(|e| FsError::store("tree_delete_root", e))
    }

    // TODO: walk the root directory and report NotEmpty once the tree tracks
    // directory entries beyond the root linkage.
    fn ensure_empty(&self, _record: &FilesystemRecord) -> Result<()> {
        Ok(())
    }

    pub async fn delete_filesystem(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let result = self.delete_locked(&mut registry, name).await;
        info!("delete_filesystem fs_name={} rc={}", name, rc_of(&result));
        result
    }

    async fn delete_locked(&self, registry: &mut Registry, name: &str) -> Result<()> {
        let record = registry.lookup(name).ok_or_else(|| {
            error!("Can not delete {}. FS doesn't exist.", name);
            FsError::NotFound(name.to_string())
        })?;

        if record.export().is_some() {
            error!("Can not delete exported FS {}", name);
            return Err(FsError::StillExported(name.to_string()));
        }

        if let Err(e) = self.ensure_empty(record) {
            error!("Can not delete FS {}. It is not empty", name);
            return Err(e);
        }

        let ns = record.namespace().clone();
        let tree = match record.tree {
            Some(tree) => tree,
            None => self
                .backends
                .trees
                .init(&ns)
                .await
                .map_err(|e| FsError::store("tree_init", e))?,
        };

        self.delete_root(&tree).await?;
        self.backends
            .trees
            .delete(tree)
            .await
            .map_err(|e| FsError::store("tree_delete", e))?;
        if let Some(record) = registry.lookup_mut(name) {
            record.tree = None;
        }

        registry.remove(name);

        self.backends
            .namespaces
            .delete(&ns)
            .await
            .map_err(|e| FsError::store("ns_delete", e))
    }

    pub async fn create_export(&self, name: &str, options: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let result = self.create_export_locked(&mut registry, name, options).await;
        info!("create_export endpoint_name={} rc={}", name, rc_of(&result));
        result
    }

    async fn create_export_locked(&self, registry: &mut Registry, name: &str, options: &str) -> Result<()> {
        let record = registry.lookup(name).ok_or_else(|| {
            error!("Can't create endpoint for non existent fs {}", name);
            FsError::NotFound(name.to_string())
        })?;

        if record.export().is_some() {
            error!("fs={} already exported", name);
            return Err(FsError::AlreadyExported(name.to_string()));
        }

        let ns_id = record.namespace().id();

        match &self.hook {
            Some(hook) => hook.on_create_export(name, ns_id, options).await?,
            None => warn!("Protocol-specific operation for creating export is not executed."),
        }

        let tenant = self
            .backends
            .tenants
            .create(name, ns_id, options)
            .await
            .map_err(|e| FsError::store("tenant_create", e))?;

        let record = registry
            .lookup_mut(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        record.export = Some(tenant);
        Ok(())
    }

    pub async fn delete_export(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let result = self.delete_export_locked(&mut registry, name).await;
        info!("delete_export endpoint_name={} rc={}", name, rc_of(&result));
        result
    }

    async fn delete_export_locked(&self, registry: &mut Registry, name: &str) -> Result<()> {
        let record = registry.lookup(name).ok_or_else(|| {
            error!("Can not delete {}. endpoint for non existent fs", name);
            FsError::NotFound(name.to_string())
        })?;

        let tenant = record.export().cloned().ok_or_else(|| {
            error!("Can not delete {}. endpoint doesn't exist", name);
            FsError::NotFound(format!("no export for {}", name))
        })?;
        let ns_id = record.namespace().id();

        match &self.hook {
            Some(hook) => {
                if let Err(e) = hook.on_delete_export(name, ns_id, &tenant.info()).await {
                    warn!("Protocol-specific export removal for {} failed: {}", name, e);
                }
            }
            None => warn!("Protocol-specific operation for deleting export is not executed."),
        }

        self.backends
            .tenants
            .delete(&tenant)
            .await
            .map_err(|e| FsError::store("tenant_delete", e))?;

        if let Some(record) = registry.lookup_mut(name) {
            record.export = None;
        }
        Ok(())
    }

    /// Resolves `name` to a data-path context, materializing its tree handle on first use.
    pub async fn open_filesystem(&self, name: &str) -> Result<Arc<FsContext>> {
        let mut registry = self.registry.lock().await;
        let record = registry.lookup_mut(name).ok_or_else(|| {
            error!("{} FS not found", name);
            FsError::NotFound(name.to_string())
        })?;

        let tree = match record.tree {
            Some(tree) => tree,
            None => {
                let tree = self
                    .backends
                    .trees
                    .init(record.namespace())
                    .await
                    .map_err(|e| {
                        error!("Cannot open tree for fs_name={}: {}", name, e);
                        FsError::store("tree_init", e)
                    })?;
                record.tree = Some(tree);
                tree
            }
        };

        Ok(Arc::new(FsContext::new(
            record.namespace().clone(),
            tree,
            self.backends.objects.clone(),
        )))
    }

    /// Finalizes the context's tree handle and forgets it in the registry.
    pub async fn close_filesystem(&self, ctx: &FsContext) -> Result<()> {
        self.backends
            .trees
            .fini(ctx.tree())
            .await
            .map_err(|e| FsError::store("tree_fini", e))?;
        if let Some(record) = self.registry.lock().await.lookup_mut(ctx.name()) {
            record.tree = None;
        }
        Ok(())
    }
}
