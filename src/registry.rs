// src/registry.rs
//! The shared bindings table.
//!
//! One table per node holds every known binding, local and remote, plus a
//! reverse index from monitor handle to name so a bare DOWN notification
//! can be traced back to its binding. Readers run on caller threads
//! concurrently with the registrar; every insert and delete is atomic at
//! row granularity.

use crate::monitor::MonitorHandle;
use crate::principal::{NodeId, PrincipalRef};
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Opaque key-value attributes attached to a binding.
pub type Meta = BTreeMap<String, String>;

/// Who owns a binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Registered on this node; the home node is authoritative for it.
    Local,
    /// Replicated from the named peer.
    Remote(NodeId),
}

impl Origin {
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local)
    }
}

/// A `name -> principal` record.
///
/// Local bindings carry the handle of the monitor installed on their
/// principal; remote bindings never do.
#[derive(Clone, Debug)]
pub struct Binding {
    pub name: String,
    pub principal: PrincipalRef,
    pub origin: Origin,
    pub handle: Option<MonitorHandle>,
    pub meta: Meta,
}

/// Concurrent bindings store plus the reverse index.
pub struct RegistryTable {
    bindings: DashMap<String, Binding>,
    reverse: DashMap<MonitorHandle, String>,
}

impl RegistryTable {
    pub fn new() -> Self {
        Self {
            bindings: DashMap::new(),
            reverse: DashMap::new(),
        }
    }

    /// Install a binding. A local binding also gets its reverse-index
    /// entry. Replaces any existing row for the name.
    pub fn insert(&self, binding: Binding) {
        if let Some(handle) = binding.handle {
            self.reverse.insert(handle, binding.name.clone());
        }
        self.bindings.insert(binding.name.clone(), binding);
    }

    /// Point lookup; clones the row out so readers never hold a shard
    /// lock across their own work.
    pub fn get(&self, name: &str) -> Option<Binding> {
        self.bindings.get(name).map(|b| b.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Principal currently bound to `name`, if any.
    pub fn whereis(&self, name: &str) -> Option<PrincipalRef> {
        self.bindings.get(name).map(|b| b.principal.clone())
    }

    /// Remove a binding by name. Does not touch the reverse index.
    pub fn remove(&self, name: &str) -> Option<Binding> {
        self.bindings.remove(name).map(|(_, b)| b)
    }

    /// Overwrite the meta of an existing binding in place.
    pub fn set_meta(&self, name: &str, meta: Meta) -> bool {
        match self.bindings.get_mut(name) {
            Some(mut b) => {
                b.meta = meta;
                true
            }
            None => false,
        }
    }

    /// Resolve a monitor handle back to its name, removing the entry.
    pub fn take_reverse(&self, handle: MonitorHandle) -> Option<String> {
        self.reverse.remove(&handle).map(|(_, name)| name)
    }

    pub fn remove_reverse(&self, handle: MonitorHandle) {
        self.reverse.remove(&handle);
    }

    /// Delete every binding replicated from `node`. Reverse-index entries
    /// need no scrub: they exist only for local bindings.
    pub fn purge_origin(&self, node: &NodeId) -> usize {
        let before = self.bindings.len();
        self.bindings
            .retain(|_, b| b.origin != Origin::Remote(node.clone()));
        before - self.bindings.len()
    }

    /// All names, any origin.
    pub fn names(&self) -> Vec<String> {
        self.bindings.iter().map(|b| b.name.clone()).collect()
    }

    /// All `(name, principal)` pairs, any origin.
    pub fn info(&self) -> Vec<(String, PrincipalRef)> {
        self.bindings
            .iter()
            .map(|b| (b.name.clone(), b.principal.clone()))
            .collect()
    }

    /// Names of bindings owned by this node.
    pub fn local_names(&self) -> Vec<String> {
        self.bindings
            .iter()
            .filter(|b| b.origin.is_local())
            .map(|b| b.name.clone())
            .collect()
    }

    /// `(name, principal, meta)` snapshot of bindings owned by this node;
    /// this is exactly what a sync response ships.
    pub fn local_info(&self) -> Vec<(String, PrincipalRef, Meta)> {
        self.bindings
            .iter()
            .filter(|b| b.origin.is_local())
            .map(|b| (b.name.clone(), b.principal.clone(), b.meta.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl Default for RegistryTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_binding(name: &str, pid: u64, handle: MonitorHandle) -> Binding {
        Binding {
            name: name.to_string(),
            principal: PrincipalRef::new(pid, NodeId::new("a")),
            origin: Origin::Local,
            handle: Some(handle),
            meta: Meta::new(),
        }
    }

    fn remote_binding(name: &str, pid: u64, node: &str) -> Binding {
        Binding {
            name: name.to_string(),
            principal: PrincipalRef::new(pid, NodeId::new(node)),
            origin: Origin::Remote(NodeId::new(node)),
            handle: None,
            meta: Meta::new(),
        }
    }

    #[test]
    fn insert_and_lookup() {
        let table = RegistryTable::new();
        let h = MonitorHandle::next();
        table.insert(local_binding("x", 7, h));

        assert!(table.contains("x"));
        let p = table.whereis("x").expect("bound");
        assert_eq!(p.id, 7);
        assert!(table.whereis("y").is_none());
    }

    #[test]
    fn reverse_index_tracks_local_bindings() {
        let table = RegistryTable::new();
        let h = MonitorHandle::next();
        table.insert(local_binding("x", 7, h));

        assert_eq!(table.take_reverse(h).as_deref(), Some("x"));
        // Consumed: a second lookup finds nothing.
        assert!(table.take_reverse(h).is_none());
    }

    #[test]
    fn remote_bindings_have_no_reverse_entry() {
        let table = RegistryTable::new();
        table.insert(remote_binding("x", 7, "b"));
        assert!(table.get("x").unwrap().handle.is_none());
    }

    #[test]
    fn purge_origin_removes_only_that_peer() {
        let table = RegistryTable::new();
        table.insert(local_binding("here", 1, MonitorHandle::next()));
        table.insert(remote_binding("b1", 2, "b"));
        table.insert(remote_binding("b2", 3, "b"));
        table.insert(remote_binding("c1", 4, "c"));

        let purged = table.purge_origin(&NodeId::new("b"));
        assert_eq!(purged, 2);
        assert!(table.contains("here"));
        assert!(table.contains("c1"));
        assert!(!table.contains("b1"));
        assert!(!table.contains("b2"));
    }

    #[test]
    fn local_info_excludes_remote_rows() {
        let table = RegistryTable::new();
        let h = MonitorHandle::next();
        let mut b = local_binding("x", 1, h);
        b.meta.insert("k".into(), "1".into());
        table.insert(b);
        table.insert(remote_binding("y", 2, "b"));

        let snapshot = table.local_info();
        assert_eq!(snapshot.len(), 1);
        let (name, principal, meta) = &snapshot[0];
        assert_eq!(name, "x");
        assert_eq!(principal.id, 1);
        assert_eq!(meta.get("k").map(String::as_str), Some("1"));
    }

    #[test]
    fn set_meta_updates_in_place() {
        let table = RegistryTable::new();
        table.insert(local_binding("x", 1, MonitorHandle::next()));

        let mut meta = Meta::new();
        meta.insert("k".into(), "1".into());
        assert!(table.set_meta("x", meta.clone()));
        assert_eq!(table.get("x").unwrap().meta, meta);
        assert!(!table.set_meta("missing", meta));
    }
}
