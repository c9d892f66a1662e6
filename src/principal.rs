// src/principal.rs
//! Node and principal identities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pid of the registrar pseudo-principal on every node. Real principals
/// are allocated pids starting above this.
pub(crate) const REGISTRAR_PID: u64 = 1;

/// Identity of a node in the cluster.
///
/// The derived `Ord` (lexicographic on the underlying string) is the total
/// order the whole cluster agrees on; clash resolution depends on every
/// node ranking the same pair of identities the same way.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Reference to a live principal: a pid plus the identity of its home
/// node. Cheap to clone and safe to ship across the wire; holding one
/// does not keep the principal alive.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalRef {
    pub id: u64,
    pub node: NodeId,
}

impl PrincipalRef {
    pub fn new(id: u64, node: NodeId) -> Self {
        Self { id, node }
    }

    /// The registrar endpoint on `node`, viewed as a principal. Peer
    /// liveness monitors attach to this.
    pub(crate) fn registrar(node: NodeId) -> Self {
        Self { id: REGISTRAR_PID, node }
    }

    /// Whether this principal lives on `node`.
    pub fn is_on(&self, node: &NodeId) -> bool {
        &self.node == node
    }
}

impl fmt::Debug for PrincipalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.node)
    }
}
