// src/registrar.rs
//! The registrar: one task per node owning all registry mutations.
//!
//! Every write to the bindings table goes through this task's mailbox, in
//! FIFO order: local API calls, peer notifications, DOWN events and
//! membership events. Reads never come here; they hit the table directly.
//!
//! Convergence rests on two rules. Only a binding's home node mutates it
//! authoritatively, everyone else learns by notification; and when two
//! nodes register the same name concurrently, both sides resolve the
//! clash with the same total order on node identities, so no negotiation
//! is needed.

use crate::config::Priority;
use crate::error::Result;
use crate::monitor::{Down, DownSink, MonitorHandle};
use crate::network::{Transport, REGISTRAR_ENDPOINT};
use crate::node::Procs;
use crate::principal::{NodeId, PrincipalRef};
use crate::registry::{Binding, Meta, Origin, RegistryTable};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Messages exchanged between registrars, bincode-encoded on the
/// `registrar` endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerMsg {
    /// "Send me your local bindings."
    SyncReq { from: NodeId },
    /// Bulk snapshot of the sender's local bindings.
    SyncResp {
        from: NodeId,
        regs: Vec<(String, PrincipalRef, Meta)>,
    },
    /// Single-entry announcement of a fresh registration.
    Register {
        from: NodeId,
        name: String,
        principal: PrincipalRef,
    },
    /// The sender dropped its local binding for `name`.
    Unregister { from: NodeId, name: String },
    /// Metadata overwrite for a binding the sender owns.
    AddMeta {
        from: NodeId,
        name: String,
        meta: Meta,
    },
}

impl PeerMsg {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Everything the registrar's mailbox carries.
pub(crate) enum RegistrarMsg {
    Register {
        name: String,
        principal: PrincipalRef,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        name: String,
        reply: oneshot::Sender<()>,
    },
    SetMeta {
        name: String,
        meta: Meta,
        reply: oneshot::Sender<bool>,
    },
    SetPriority(Priority),
    Peer(PeerMsg),
    Down(Down),
    NodeUp(NodeId),
    NodeDown(NodeId),
}

pub(crate) struct Registrar {
    node: NodeId,
    table: Arc<RegistryTable>,
    procs: Arc<Procs>,
    transport: Arc<dyn Transport>,
    /// Registrars this node currently has a live link to, by the handle
    /// of the link monitor watching them.
    peers: HashMap<NodeId, MonitorHandle>,
    /// Sink handed to every monitor we install; a forwarder funnels it
    /// back into our own mailbox.
    down_tx: DownSink,
    budget: usize,
}

impl Registrar {
    pub(crate) fn spawn(
        node: NodeId,
        table: Arc<RegistryTable>,
        procs: Arc<Procs>,
        transport: Arc<dyn Transport>,
        down_tx: DownSink,
        priority: Priority,
        rx: mpsc::UnboundedReceiver<RegistrarMsg>,
    ) {
        let registrar = Self {
            node,
            table,
            procs,
            transport,
            peers: HashMap::new(),
            down_tx,
            budget: priority.budget(),
        };
        tokio::spawn(registrar.run(rx));
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RegistrarMsg>) {
        let mut slice = 0usize;
        while let Some(msg) = rx.recv().await {
            self.handle(msg);
            slice += 1;
            if slice >= self.budget {
                slice = 0;
                tokio::task::yield_now().await;
            }
        }
    }

    fn handle(&mut self, msg: RegistrarMsg) {
        match msg {
            RegistrarMsg::Register { name, principal, reply } => {
                let _ = reply.send(self.register(name, principal));
            }
            RegistrarMsg::Unregister { name, reply } => {
                self.unregister(&name);
                let _ = reply.send(());
            }
            RegistrarMsg::SetMeta { name, meta, reply } => {
                let _ = reply.send(self.set_meta(&name, meta));
            }
            RegistrarMsg::SetPriority(p) => {
                self.budget = p.budget();
            }
            RegistrarMsg::Peer(msg) => self.on_peer(msg),
            RegistrarMsg::Down(down) => self.on_down(down),
            RegistrarMsg::NodeUp(node) => self.on_node_up(node),
            RegistrarMsg::NodeDown(node) => {
                // The link monitor delivers the authoritative DOWN and
                // performs the purge; acting here as well would race it.
                debug!(node = %self.node, peer = %node, "node down observed");
            }
        }
    }

    // --- Mutation API (home-node only) ---

    fn register(&mut self, name: String, principal: PrincipalRef) -> bool {
        if !principal.is_on(&self.node) {
            debug!(node = %self.node, %name, principal = ?principal, "rejecting non-local registration");
            return false;
        }
        if self.table.contains(&name) {
            debug!(node = %self.node, %name, "rejecting registration, name taken");
            return false;
        }

        let handle = self.procs.monitor(&principal, self.down_tx.clone());
        self.table.insert(Binding {
            name: name.clone(),
            principal: principal.clone(),
            origin: Origin::Local,
            handle: Some(handle),
            meta: Meta::new(),
        });
        self.broadcast(&PeerMsg::Register {
            from: self.node.clone(),
            name,
            principal,
        });
        true
    }

    fn unregister(&mut self, name: &str) {
        let Some(binding) = self.table.get(name) else {
            return;
        };
        if !binding.origin.is_local() {
            return;
        }
        if let Some(handle) = binding.handle {
            self.procs.demonitor(binding.principal.id, handle);
            self.table.remove_reverse(handle);
        }
        self.table.remove(name);
        self.broadcast(&PeerMsg::Unregister {
            from: self.node.clone(),
            name: name.to_string(),
        });
    }

    fn set_meta(&mut self, name: &str, meta: Meta) -> bool {
        match self.table.get(name) {
            Some(binding) if binding.origin.is_local() => {
                self.table.set_meta(name, meta.clone());
                self.broadcast(&PeerMsg::AddMeta {
                    from: self.node.clone(),
                    name: name.to_string(),
                    meta,
                });
                true
            }
            _ => false,
        }
    }

    // --- Inbound peer traffic ---

    fn on_peer(&mut self, msg: PeerMsg) {
        match msg {
            PeerMsg::SyncReq { from } => self.on_sync_req(from),
            PeerMsg::SyncResp { from, regs } => self.on_sync_resp(from, regs),
            PeerMsg::Register { from, name, principal } => {
                if !self.known_peer(&from, "register") {
                    return;
                }
                self.apply_register(&from, name, principal, Meta::new());
            }
            PeerMsg::Unregister { from, name } => {
                if !self.known_peer(&from, "unregister") {
                    return;
                }
                if let Some(b) = self.table.get(&name) {
                    // Only the owning peer gets to retract a binding;
                    // anything else is a stale or misdirected removal.
                    if b.origin == Origin::Remote(from) {
                        self.table.remove(&name);
                    }
                }
            }
            PeerMsg::AddMeta { from, name, meta } => {
                if !self.known_peer(&from, "add_meta") {
                    return;
                }
                if let Some(b) = self.table.get(&name) {
                    if b.origin == Origin::Remote(from) {
                        self.table.set_meta(&name, meta);
                    }
                }
            }
        }
    }

    /// Notifications are only honored from connected peers; a stray late
    /// message from a disconnected node must not re-corrupt state ahead
    /// of its DOWN.
    fn known_peer(&self, from: &NodeId, what: &str) -> bool {
        if self.peers.contains_key(from) {
            true
        } else {
            warn!(node = %self.node, peer = %from, what, "dropping notification from unknown peer");
            false
        }
    }

    fn on_sync_req(&mut self, from: NodeId) {
        let regs = self.table.local_info();
        debug!(node = %self.node, peer = %from, entries = regs.len(), "answering sync request");
        self.send_peer(
            &from,
            &PeerMsg::SyncResp { from: self.node.clone(), regs },
        );
        if !self.peers.contains_key(&from) {
            self.add_peer(from.clone());
            // Close the handshake: the peer may have missed our node-up
            // edge, so ask for its bindings explicitly.
            self.send_peer(&from, &PeerMsg::SyncReq { from: self.node.clone() });
        }
    }

    fn on_sync_resp(&mut self, from: NodeId, regs: Vec<(String, PrincipalRef, Meta)>) {
        debug!(node = %self.node, peer = %from, entries = regs.len(), "applying sync response");
        for (name, principal, meta) in regs {
            self.apply_register(&from, name, principal, meta);
        }
        if !self.peers.contains_key(&from) {
            self.add_peer(from);
        }
    }

    /// Shared apply path for single announcements and bulk sync entries;
    /// announcements carry no meta and pass the empty map.
    fn apply_register(&mut self, from: &NodeId, name: String, principal: PrincipalRef, meta: Meta) {
        match self.table.get(&name) {
            None => {
                self.table.insert(Binding {
                    name,
                    origin: Origin::Remote(principal.node.clone()),
                    principal,
                    handle: None,
                    meta,
                });
            }
            Some(old) if old.principal == principal => {
                // Duplicate announcement.
            }
            Some(old) => self.resolve_clash(from, name, principal, meta, old),
        }
    }

    /// Two nodes registered `name` concurrently. The binding whose home
    /// node ranks smaller wins; both sides of the clash reach the same
    /// verdict independently.
    fn resolve_clash(
        &mut self,
        from: &NodeId,
        name: String,
        incoming: PrincipalRef,
        meta: Meta,
        standing: Binding,
    ) {
        if !incoming_wins(&incoming.node, &standing.principal.node) {
            // The winning side reaches the same verdict and will
            // broadcast; nothing to do with the loser's announcement.
            debug!(node = %self.node, %name, peer = %from, "dropping losing registration");
            return;
        }

        info!(
            node = %self.node, %name,
            winner = %incoming.node, loser = %standing.principal.node,
            "resolving name clash"
        );
        self.table.insert(Binding {
            name: name.clone(),
            origin: Origin::Remote(incoming.node.clone()),
            principal: incoming,
            handle: None,
            meta,
        });

        if standing.origin.is_local() {
            // Our principal lost. Kill it; the reverse-index entry stays
            // until its DOWN arrives, and the DOWN handler will find the
            // binding already overwritten and leave it alone.
            self.procs.kill(standing.principal.id);
        }
    }

    // --- Liveness ---

    fn on_down(&mut self, down: Down) {
        // A handle in the reverse index means a local principal died.
        if let Some(name) = self.table.take_reverse(down.handle) {
            match self.table.get(&name) {
                Some(b) if b.handle == Some(down.handle) && b.principal == down.principal => {
                    debug!(node = %self.node, %name, reason = ?down.reason, "local principal down");
                    self.table.remove(&name);
                    self.broadcast(&PeerMsg::Unregister {
                        from: self.node.clone(),
                        name,
                    });
                }
                // A clash win from remote raced ahead of this DOWN and
                // already overwrote the binding.
                _ => {}
            }
            return;
        }

        // Otherwise it may be a peer registrar's link monitor.
        let peer = self
            .peers
            .iter()
            .find(|(_, h)| **h == down.handle)
            .map(|(n, _)| n.clone());
        match peer {
            Some(node) => {
                self.peers.remove(&node);
                let purged = self.table.purge_origin(&node);
                info!(node = %self.node, peer = %node, purged, "peer down, purged its bindings");
            }
            None => {
                // Demonitored before the DOWN drained; stale.
                debug!(node = %self.node, handle = ?down.handle, "stale down notification");
            }
        }
    }

    fn on_node_up(&mut self, node: NodeId) {
        if node == self.node {
            return;
        }
        debug!(node = %self.node, peer = %node, "node up, requesting sync");
        // No state change yet; the peer set is updated by the sync
        // handshake itself.
        self.send_peer(&node, &PeerMsg::SyncReq { from: self.node.clone() });
    }

    fn add_peer(&mut self, node: NodeId) {
        let handle = self.transport.monitor_peer(&node, self.down_tx.clone());
        info!(node = %self.node, peer = %node, "peer connected");
        self.peers.insert(node, handle);
    }

    // --- Outbound ---

    fn send_peer(&self, node: &NodeId, msg: &PeerMsg) {
        match msg.encode() {
            Ok(payload) => self.transport.send_to(node, REGISTRAR_ENDPOINT, payload),
            Err(e) => warn!(node = %self.node, error = %e, "failed to encode peer message"),
        }
    }

    /// Fan one message out to every connected peer. Best-effort: loss is
    /// recovered by the eventual DOWN + resync cycle.
    fn broadcast(&self, msg: &PeerMsg) {
        if self.peers.is_empty() {
            return;
        }
        let payload = match msg.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!(node = %self.node, error = %e, "failed to encode broadcast");
                return;
            }
        };
        for node in self.peers.keys() {
            self.transport
                .send_to(node, REGISTRAR_ENDPOINT, payload.clone());
        }
    }
}

/// The clash rule: the incoming registration wins iff its home node ranks
/// strictly smaller than the standing one's.
fn incoming_wins(incoming: &NodeId, standing: &NodeId) -> bool {
    incoming < standing
}
