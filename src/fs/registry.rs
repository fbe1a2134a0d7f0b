use std::collections::VecDeque;
use tracing::{debug, error};
use crate::error::Result;
use crate::storage::{ExportInfo, Namespace, Tenant, TreeHandle};

/// One named filesystem known to this process.
#[derive(Debug, Clone)]
pub struct FilesystemRecord {
    namespace: Namespace,
    pub(crate) tree: Option<TreeHandle>,
    pub(crate) export: Option<Tenant>,
}

impl FilesystemRecord {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            tree: None,
            export: None,
        }
    }

    pub fn name(&self) -> &str {
        self.namespace.name()
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn tree(&self) -> Option<&TreeHandle> {
        self.tree.as_ref()
    }

    pub fn export(&self) -> Option<&Tenant> {
        self.export.as_ref()
    }

    pub fn export_info(&self) -> Option<ExportInfo> {
        self.export.as_ref().map(Tenant::info)
    }

    pub fn list_entry(&self) -> ListEntry {
        ListEntry {
            name: self.name().to_string(),
            export: self.export_info(),
        }
    }
}

/// What a scan hands to its visitor for each filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    /// `None` when the filesystem is not exported.
    pub export: Option<ExportInfo>,
}

/// Filesystems keyed by name, most recently created first.
#[derive(Debug, Default)]
pub struct Registry {
    records: VecDeque<FilesystemRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn lookup(&self, name: &str) -> Option<&FilesystemRecord> {
        let found = self.records.iter().find(|r| r.name() == name);
        debug!("lookup {} found={}", name, found.is_some());
        found
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut FilesystemRecord> {
        self.records.iter_mut().find(|r| r.name() == name)
    }

    /// Prepends `record`. Name uniqueness is the caller's check.
    pub fn insert(&mut self, record: FilesystemRecord) {
        self.records.push_front(record);
    }

    pub fn remove(&mut self, name: &str) -> Option<FilesystemRecord> {
        let pos = self.records.iter().position(|r| r.name() == name)?;
        self.records.remove(pos)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilesystemRecord> {
        self.records.iter()
    }

    /// Lazy view over the current records; call again to restart.
    pub fn entries(&self) -> impl Iterator<Item = ListEntry> + '_ {
        self.records.iter().map(FilesystemRecord::list_entry)
    }

    /// Feeds every entry to `visit`, stopping at the first error.
    pub fn scan<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&ListEntry) -> Result<()>,
    {
        for entry in self.entries() {
            visit(&entry)?;
        }
        Ok(())
    }

    /// Adds one record per namespace. Names already present are logged and skipped.
    pub fn populate(&mut self, namespaces: Vec<Namespace>) -> usize {
        let mut added = 0;
        for ns in namespaces {
            if self.lookup(ns.name()).is_some() {
                error!("skipping namespace {} (id {}): name already registered", ns.name(), ns.id());
                continue;
            }
            self.insert(FilesystemRecord::new(ns));
            added += 1;
        }
        added
    }

    /// Detaches every export binding without touching the catalog.
    pub fn clear_exports(&mut self) {
        for record in self.records.iter_mut() {
            record.export = None;
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;

    fn registry_of(names: &[&str]) -> Registry {
        let mut registry = Registry::new();
        let namespaces = names
            .iter()
            .enumerate()
            .map(|(i, n)| Namespace::new(*n, i as u16 + 1))
            .collect();
        registry.populate(namespaces);
        registry
    }

    #[test]
    fn test_lookup_is_exact() {
        let registry = registry_of(&["alpha", "Beta"]);
        assert_eq!(registry.lookup("alpha").unwrap().name(), "alpha");
        assert!(registry.lookup("beta").is_none());
        assert!(registry.lookup("alp").is_none());
        assert!(registry.lookup("alpha ").is_none());
    }

    #[test]
    fn test_insert_prepends() {
        let registry = registry_of(&["first", "second", "third"]);
        let names: Vec<_> = registry.entries().map(|e| e.name).collect();
        assert_eq!(names, vec!["third", "second", "first"]);
    }

    #[test]
    fn test_populate_skips_duplicates() {
        let mut registry = Registry::new();
        let added = registry.populate(vec![
            Namespace::new("a", 1),
            Namespace::new("a", 2),
            Namespace::new("b", 3),
        ]);
        assert_eq!(added, 2);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("a").unwrap().namespace().id(), 1);
        assert!(registry.lookup("a").unwrap().tree().is_none());
        assert!(registry.lookup("a").unwrap().export().is_none());
    }

    #[test]
    fn test_scan_stops_on_error() {
        let registry = registry_of(&["a", "b", "c"]);
        let mut seen = Vec::new();
        let result = registry.scan(|entry| {
            seen.push(entry.name.clone());
            if entry.name == "b" {
                return Err(FsError::Fault("visitor gave up".to_string()));
            }
            Ok(())
        });
        assert!(matches!(result, Err(FsError::Fault(_))));
        assert_eq!(seen, vec!["c", "b"]);
    }

    #[test]
    fn test_entries_restartable() {
        let mut registry = registry_of(&["a"]);
        registry.lookup_mut("a").unwrap().export = Some(Tenant::new("a", 1, "ro"));

        let first: Vec<_> = registry.entries().collect();
        let second: Vec<_> = registry.entries().collect();
        assert_eq!(first, second);
        assert_eq!(first[0].export.as_ref().unwrap().options, "ro");

        registry.clear_exports();
        assert!(registry.entries().all(|e| e.export.is_none()));
    }

    #[test]
    fn test_remove() {
        let mut registry = registry_of(&["a", "b"]);
        assert_eq!(registry.remove("a").unwrap().name(), "a");
        assert!(registry.remove("a").is_none());
        assert_eq!(registry.len(), 1);
        registry.clear();
        assert!(registry.is_empty());
    }
}
