// src/node.rs
//! A node: principal runtime plus the registry's public surface.
//!
//! `Node` owns the shared table, the process table of local principals
//! and the registrar task. Mutations are serialized through the
//! registrar; `whereis_name`, `send` and the enumeration reads go to the
//! table directly and tolerate racing writers.

use crate::config::{NodeConfig, Priority};
use crate::mailbox::{self, Message, SystemMessage};
use crate::monitor::{Down, DownSink, ExitReason, MonitorHandle};
use crate::network::{MembershipEvent, Transport, PROC_ENDPOINT, REGISTRAR_ENDPOINT};
use crate::principal::{NodeId, PrincipalRef, REGISTRAR_PID};
use crate::registrar::{PeerMsg, Registrar, RegistrarMsg};
use crate::registry::{Binding, Meta, RegistryTable};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

struct ProcEntry {
    sender: mailbox::MailboxSender,
    watchers: Mutex<Vec<(MonitorHandle, DownSink)>>,
}

/// Table of live local principals.
pub(crate) struct Procs {
    node: NodeId,
    entries: DashMap<u64, Arc<ProcEntry>>,
    next_pid: AtomicU64,
}

impl Procs {
    fn new(node: NodeId) -> Self {
        Self {
            node,
            entries: DashMap::new(),
            next_pid: AtomicU64::new(REGISTRAR_PID + 1),
        }
    }

    /// Spawn a principal around a per-message handler. The runner exits
    /// on a kill signal without draining queued user messages; a reaper
    /// then notifies every watcher.
    fn spawn<F, Fut>(self: &Arc<Self>, mut handler: F) -> PrincipalRef
    where
        F: FnMut(Bytes) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let id = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mailbox::channel();
        self.entries.insert(
            id,
            Arc::new(ProcEntry { sender: tx, watchers: Mutex::new(Vec::new()) }),
        );
        let principal = PrincipalRef::new(id, self.node.clone());

        let runner = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    Message::System(SystemMessage::Kill) => return ExitReason::Killed,
                    Message::User(payload) => handler(payload).await,
                }
            }
            ExitReason::Normal
        });

        let procs = self.clone();
        let reaped = principal.clone();
        tokio::spawn(async move {
            let reason = match runner.await {
                Ok(reason) => reason,
                Err(_) => ExitReason::Panic,
            };
            procs.reap(reaped, reason);
        });

        principal
    }

    fn reap(&self, principal: PrincipalRef, reason: ExitReason) {
        if let Some((_, entry)) = self.entries.remove(&principal.id) {
            debug!(node = %self.node, principal = ?principal, reason = ?reason, "principal exited");
            let watchers = std::mem::take(&mut *entry.watchers.lock());
            for (handle, sink) in watchers {
                let _ = sink.send(Down {
                    handle,
                    principal: principal.clone(),
                    reason: reason.clone(),
                });
            }
        }
    }

    /// Watch a local principal. If it is already gone the DOWN is
    /// delivered immediately with `NoProc`.
    pub(crate) fn monitor(&self, principal: &PrincipalRef, sink: DownSink) -> MonitorHandle {
        let handle = MonitorHandle::next();
        match self.entries.get(&principal.id) {
            Some(entry) => entry.watchers.lock().push((handle, sink)),
            None => {
                let _ = sink.send(Down {
                    handle,
                    principal: principal.clone(),
                    reason: ExitReason::NoProc,
                });
            }
        }
        handle
    }

    pub(crate) fn demonitor(&self, pid: u64, handle: MonitorHandle) {
        if let Some(entry) = self.entries.get(&pid) {
            entry.watchers.lock().retain(|(h, _)| *h != handle);
        }
    }

    /// Enqueue a kill. The mailbox delivers it ahead of pending user
    /// messages; a dead pid is a no-op.
    pub(crate) fn kill(&self, pid: u64) {
        if let Some(entry) = self.entries.get(&pid) {
            let _ = entry.sender.send_system(SystemMessage::Kill);
        }
    }

    /// Deliver user bytes to a local pid; silently dropped on a miss.
    fn deliver(&self, pid: u64, payload: Bytes) {
        if let Some(entry) = self.entries.get(&pid) {
            let _ = entry.sender.send_user(payload);
        }
    }

    fn is_alive(&self, pid: u64) -> bool {
        self.entries.contains_key(&pid)
    }
}

struct NodeInner {
    node: NodeId,
    table: Arc<RegistryTable>,
    procs: Arc<Procs>,
    transport: Arc<dyn Transport>,
    registrar: mpsc::UnboundedSender<RegistrarMsg>,
}

/// One node of the distributed registry.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, NodeConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: NodeConfig) -> Self {
        let node = transport.local_node();
        let table = Arc::new(RegistryTable::new());
        let procs = Arc::new(Procs::new(node.clone()));
        let (reg_tx, reg_rx) = mpsc::unbounded_channel();

        // All monitor DOWNs funnel into the registrar mailbox.
        let (down_tx, mut down_rx) = mpsc::unbounded_channel::<Down>();
        let tx = reg_tx.clone();
        tokio::spawn(async move {
            while let Some(down) = down_rx.recv().await {
                if tx.send(RegistrarMsg::Down(down)).is_err() {
                    break;
                }
            }
        });

        // Membership events from the transport.
        let (mem_tx, mut mem_rx) = mpsc::unbounded_channel::<MembershipEvent>();
        transport.subscribe_membership(mem_tx);
        let tx = reg_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = mem_rx.recv().await {
                let msg = match event {
                    MembershipEvent::NodeUp(n) => RegistrarMsg::NodeUp(n),
                    MembershipEvent::NodeDown(n) => RegistrarMsg::NodeDown(n),
                };
                if tx.send(msg).is_err() {
                    break;
                }
            }
        });

        // Inbound registrar frames.
        let (wire_tx, mut wire_rx) = mpsc::unbounded_channel::<Bytes>();
        transport.bind_endpoint(REGISTRAR_ENDPOINT, wire_tx);
        let tx = reg_tx.clone();
        let wire_node = node.clone();
        tokio::spawn(async move {
            while let Some(frame) = wire_rx.recv().await {
                match PeerMsg::decode(&frame) {
                    Ok(msg) => {
                        if tx.send(RegistrarMsg::Peer(msg)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(node = %wire_node, error = %e, "dropping undecodable frame"),
                }
            }
        });

        // Inbound user messages for local principals: [PID:u64][PAYLOAD].
        let (proc_tx, mut proc_rx) = mpsc::unbounded_channel::<Bytes>();
        transport.bind_endpoint(PROC_ENDPOINT, proc_tx);
        let proc_procs = procs.clone();
        tokio::spawn(async move {
            while let Some(mut frame) = proc_rx.recv().await {
                if frame.len() < 8 {
                    continue;
                }
                let pid = frame.get_u64();
                proc_procs.deliver(pid, frame);
            }
        });

        Registrar::spawn(
            node.clone(),
            table.clone(),
            procs.clone(),
            transport.clone(),
            down_tx,
            config.priority,
            reg_rx,
        );

        Self {
            inner: Arc::new(NodeInner { node, table, procs, transport, registrar: reg_tx }),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.inner.node.clone()
    }

    // --- Principals ---

    /// Spawn a local principal; `handler` runs once per delivered
    /// message.
    pub fn spawn<F, Fut>(&self, handler: F) -> PrincipalRef
    where
        F: FnMut(Bytes) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.inner.procs.spawn(handler)
    }

    /// Forcibly terminate a local principal. Remote refs are ignored.
    pub fn kill(&self, principal: &PrincipalRef) {
        if principal.is_on(&self.inner.node) {
            self.inner.procs.kill(principal.id);
        }
    }

    pub fn is_alive(&self, principal: &PrincipalRef) -> bool {
        principal.is_on(&self.inner.node) && self.inner.procs.is_alive(principal.id)
    }

    // --- Registry mutations (serialized through the registrar) ---

    /// Register `name` for a principal living on this node. Returns
    /// `false` when the principal is remote or the name is taken.
    pub async fn register_name(&self, name: impl Into<String>, principal: PrincipalRef) -> bool {
        let (reply, rx) = oneshot::channel();
        let msg = RegistrarMsg::Register { name: name.into(), principal, reply };
        if self.inner.registrar.send(msg).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Drop this node's binding for `name`. A missing or foreign name is
    /// a no-op.
    pub async fn unregister_name(&self, name: &str) {
        let (reply, rx) = oneshot::channel();
        let msg = RegistrarMsg::Unregister { name: name.to_string(), reply };
        if self.inner.registrar.send(msg).is_ok() {
            let _ = rx.await;
        }
    }

    /// Overwrite the meta of a binding owned by this node. Returns
    /// `false` (and changes nothing) when the binding is missing or the
    /// home node is elsewhere.
    pub async fn set_meta(&self, name: &str, meta: Meta) -> bool {
        let (reply, rx) = oneshot::channel();
        let msg = RegistrarMsg::SetMeta { name: name.to_string(), meta, reply };
        if self.inner.registrar.send(msg).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Adjust the registrar's scheduling priority. Best-effort.
    pub fn set_priority(&self, priority: Priority) {
        let _ = self.inner.registrar.send(RegistrarMsg::SetPriority(priority));
    }

    // --- Reads (straight off the table) ---

    pub fn whereis_name(&self, name: &str) -> Option<PrincipalRef> {
        self.inner.table.whereis(name)
    }

    /// Full binding for `name` as this node currently sees it, origin
    /// and meta included.
    pub fn lookup(&self, name: &str) -> Option<Binding> {
        self.inner.table.get(name)
    }

    /// Deliver `payload` to whatever principal `name` currently resolves
    /// to; a miss, or a binding that vanishes underneath us, drops the
    /// message.
    pub fn send(&self, name: &str, payload: Bytes) {
        let Some(principal) = self.inner.table.whereis(name) else {
            return;
        };
        if principal.is_on(&self.inner.node) {
            self.inner.procs.deliver(principal.id, payload);
        } else {
            let mut frame = BytesMut::with_capacity(8 + payload.len());
            frame.put_u64(principal.id);
            frame.put(payload);
            self.inner
                .transport
                .send_to(&principal.node, PROC_ENDPOINT, frame.freeze());
        }
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.inner.table.names()
    }

    pub fn registered_info(&self) -> Vec<(String, PrincipalRef)> {
        self.inner.table.info()
    }

    pub fn local_registered_names(&self) -> Vec<String> {
        self.inner.table.local_names()
    }

    pub fn local_registered_info(&self) -> Vec<(String, PrincipalRef, Meta)> {
        self.inner.table.local_info()
    }
}
