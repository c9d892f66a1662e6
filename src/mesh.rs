// src/mesh.rs
//! In-process cluster mesh.
//!
//! A [`MeshNet`] routes frames between transports living in the same
//! process, with explicit `connect`/`part` control over membership. This
//! is the harness the integration tests drive failure scenarios with;
//! delivery is an in-order enqueue per link, matching the FIFO contract
//! of the wired transport.

use crate::monitor::{Down, DownSink, ExitReason, MonitorHandle};
use crate::network::{MembershipEvent, Transport};
use crate::principal::{NodeId, PrincipalRef};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

struct LinkMonitor {
    handle: MonitorHandle,
    target: NodeId,
    sink: DownSink,
}

#[derive(Default)]
struct Entry {
    connected: bool,
    endpoints: HashMap<String, mpsc::UnboundedSender<Bytes>>,
    membership: Vec<mpsc::UnboundedSender<MembershipEvent>>,
    /// Monitors this node holds on other nodes' registrars.
    links: Vec<LinkMonitor>,
}

#[derive(Default)]
struct MeshState {
    nodes: HashMap<NodeId, Entry>,
}

/// A process-local peer mesh.
#[derive(Clone, Default)]
pub struct MeshNet {
    state: Arc<Mutex<MeshState>>,
}

impl MeshNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the transport for `node`. The node starts disconnected;
    /// call [`MeshNet::connect`] once its endpoints are wired up.
    pub fn transport(&self, node: impl Into<NodeId>) -> Arc<MeshTransport> {
        let node = node.into();
        self.state.lock().nodes.entry(node.clone()).or_default();
        Arc::new(MeshTransport {
            state: self.state.clone(),
            node,
        })
    }

    /// Attach `node` to the mesh: every connected pair observes a mutual
    /// `NodeUp`.
    pub fn connect(&self, node: &NodeId) {
        let mut state = self.state.lock();
        let others: Vec<NodeId> = state
            .nodes
            .iter()
            .filter(|(id, e)| *id != node && e.connected)
            .map(|(id, _)| id.clone())
            .collect();

        if let Some(entry) = state.nodes.get_mut(node) {
            if entry.connected {
                return;
            }
            entry.connected = true;
        } else {
            return;
        }

        for other in others {
            state.emit(&other, MembershipEvent::NodeUp(node.clone()));
            state.emit(node, MembershipEvent::NodeUp(other));
        }
    }

    /// Detach `node`, as a crash or partition would: survivors observe
    /// `NodeDown` and their link monitors on `node` fire; `node` itself
    /// observes the rest of the mesh going down.
    pub fn part(&self, node: &NodeId) {
        let mut state = self.state.lock();
        match state.nodes.get_mut(node) {
            Some(entry) if entry.connected => entry.connected = false,
            _ => return,
        }

        let others: Vec<NodeId> = state
            .nodes
            .iter()
            .filter(|(id, e)| *id != node && e.connected)
            .map(|(id, _)| id.clone())
            .collect();

        for other in &others {
            state.emit(other, MembershipEvent::NodeDown(node.clone()));
            state.emit(node, MembershipEvent::NodeDown(other.clone()));
            state.fire_links(other, node);
            state.fire_links(node, other);
        }
    }
}

impl MeshState {
    fn emit(&mut self, to: &NodeId, event: MembershipEvent) {
        if let Some(entry) = self.nodes.get_mut(to) {
            entry.membership.retain(|s| s.send(event.clone()).is_ok());
        }
    }

    /// Fire and discard every monitor `holder` has on `target`.
    fn fire_links(&mut self, holder: &NodeId, target: &NodeId) {
        let Some(entry) = self.nodes.get_mut(holder) else {
            return;
        };
        let mut kept = Vec::with_capacity(entry.links.len());
        for m in entry.links.drain(..) {
            if &m.target == target {
                let _ = m.sink.send(Down {
                    handle: m.handle,
                    principal: PrincipalRef::registrar(m.target),
                    reason: ExitReason::Disconnected,
                });
            } else {
                kept.push(m);
            }
        }
        entry.links = kept;
    }
}

/// One node's view of a [`MeshNet`].
pub struct MeshTransport {
    state: Arc<Mutex<MeshState>>,
    node: NodeId,
}

impl Transport for MeshTransport {
    fn local_node(&self) -> NodeId {
        self.node.clone()
    }

    fn send_to(&self, node: &NodeId, endpoint: &str, payload: Bytes) {
        let state = self.state.lock();
        let up = |id: &NodeId| state.nodes.get(id).map(|e| e.connected).unwrap_or(false);
        if !up(&self.node) || !up(node) {
            debug!(from = %self.node, to = %node, endpoint, "dropping frame, no route");
            return;
        }
        if let Some(sink) = state.nodes.get(node).and_then(|e| e.endpoints.get(endpoint)) {
            let _ = sink.send(payload);
        }
    }

    fn bind_endpoint(&self, endpoint: &str, sink: mpsc::UnboundedSender<Bytes>) {
        if let Some(entry) = self.state.lock().nodes.get_mut(&self.node) {
            entry.endpoints.insert(endpoint.to_string(), sink);
        }
    }

    fn subscribe_membership(&self, sink: mpsc::UnboundedSender<MembershipEvent>) {
        if let Some(entry) = self.state.lock().nodes.get_mut(&self.node) {
            entry.membership.push(sink);
        }
    }

    fn monitor_peer(&self, node: &NodeId, sink: DownSink) -> MonitorHandle {
        let handle = MonitorHandle::next();
        let mut state = self.state.lock();
        let target_up = state.nodes.get(node).map(|e| e.connected).unwrap_or(false);
        let self_up = state
            .nodes
            .get(&self.node)
            .map(|e| e.connected)
            .unwrap_or(false);
        if target_up && self_up {
            if let Some(entry) = state.nodes.get_mut(&self.node) {
                entry.links.push(LinkMonitor {
                    handle,
                    target: node.clone(),
                    sink,
                });
            }
        } else {
            let _ = sink.send(Down {
                handle,
                principal: PrincipalRef::registrar(node.clone()),
                reason: ExitReason::Disconnected,
            });
        }
        handle
    }
}
