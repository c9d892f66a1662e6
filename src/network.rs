// src/network.rs
//! Cluster transport: membership events, endpoint delivery, link liveness.
//!
//! The registrar talks to the cluster through the [`Transport`] trait and
//! never touches sockets. [`TcpTransport`] is the wired implementation:
//! persistent TCP links with a node-identity handshake and length-prefixed
//! frames. Trust is the link's; a TLS-wrapped transport can be substituted
//! behind the same trait.

use crate::error::{Error, Result};
use crate::monitor::{Down, DownSink, ExitReason, MonitorHandle};
use crate::principal::{NodeId, PrincipalRef};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Endpoint the registrar listens on, on every node.
pub const REGISTRAR_ENDPOINT: &str = "registrar";
/// Endpoint carrying user messages addressed to a principal's pid.
pub const PROC_ENDPOINT: &str = "proc";

/// Frames above this are treated as link corruption.
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Cluster link state changes, delivered to membership subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeUp(NodeId),
    NodeDown(NodeId),
}

/// What the registry requires of the cluster layer.
///
/// `send_to` is best-effort and non-blocking: a message to a node with no
/// live link is dropped, and the eventual DOWN + resync cycle recovers.
pub trait Transport: Send + Sync + 'static {
    fn local_node(&self) -> NodeId;

    /// Enqueue `payload` for the named endpoint on `node`.
    fn send_to(&self, node: &NodeId, endpoint: &str, payload: Bytes);

    /// Route inbound frames for `endpoint` into `sink`.
    fn bind_endpoint(&self, endpoint: &str, sink: mpsc::UnboundedSender<Bytes>);

    /// Receive membership events on `sink`.
    fn subscribe_membership(&self, sink: mpsc::UnboundedSender<MembershipEvent>);

    /// Monitor the registrar on `node` through link liveness. Delivers
    /// `Down { reason: Disconnected }` when the link drops, immediately if
    /// there is no link now.
    fn monitor_peer(&self, node: &NodeId, sink: DownSink) -> MonitorHandle;
}

struct LinkMonitor {
    handle: MonitorHandle,
    node: NodeId,
    sink: DownSink,
}

struct Conn {
    link_id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

/// TCP transport: one persistent connection per peer, hello handshake
/// carrying the node identity, frames of
/// `[LEN:u32][EP_LEN:u8][ENDPOINT][PAYLOAD]`.
pub struct TcpTransport {
    node: NodeId,
    local_addr: SocketAddr,
    /// Where known peers can be dialed, for [`TcpTransport::dial_node`].
    addrs: DashMap<NodeId, SocketAddr>,
    conns: DashMap<NodeId, Conn>,
    endpoints: DashMap<String, mpsc::UnboundedSender<Bytes>>,
    membership: Mutex<Vec<mpsc::UnboundedSender<MembershipEvent>>>,
    links: Mutex<Vec<LinkMonitor>>,
    next_link: AtomicU64,
}

impl TcpTransport {
    /// Bind a listener and start accepting peer links.
    pub async fn bind(node: NodeId, addr: SocketAddr) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let transport = Arc::new(Self {
            node,
            local_addr,
            addrs: DashMap::new(),
            conns: DashMap::new(),
            endpoints: DashMap::new(),
            membership: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
            next_link: AtomicU64::new(1),
        });

        let accept = transport.clone();
        tokio::spawn(async move {
            while let Ok((socket, peer_addr)) = listener.accept().await {
                let t = accept.clone();
                tokio::spawn(async move {
                    if let Err(e) = t.run_link(socket).await {
                        debug!(%peer_addr, error = %e, "inbound link ended");
                    }
                });
            }
        });

        info!(node = %transport.node, addr = %local_addr, "listening");
        Ok(transport)
    }

    /// Actual bound address; useful when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open a link to the peer listening at `addr`. Resolves once the
    /// handshake completes; the link is then live in both directions.
    pub async fn dial(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let socket = TcpStream::connect(addr).await?;
        // Run the handshake inline so callers know the peer is reachable,
        // then let the link tasks take over.
        self.run_link(socket).await
    }

    /// Record where `node` can be dialed.
    pub fn set_peer_addr(&self, node: NodeId, addr: SocketAddr) {
        self.addrs.insert(node, addr);
    }

    /// Dial a peer by identity through the address book.
    pub async fn dial_node(self: Arc<Self>, node: &NodeId) -> Result<()> {
        let addr = self
            .addrs
            .get(node)
            .map(|a| *a)
            .ok_or_else(|| Error::AddrUnknown(node.clone()))?;
        self.dial(addr).await
    }

    /// Handshake on a fresh socket, register the link, spawn the reader
    /// and writer, and return. Teardown happens from the spawned tasks.
    async fn run_link(self: Arc<Self>, socket: TcpStream) -> Result<()> {
        let (mut r, mut w) = socket.into_split();

        // Hello: [LEN:u16][NODE_ID] in each direction, ours first.
        let our = self.node.as_str().as_bytes();
        let mut hello = BytesMut::with_capacity(2 + our.len());
        hello.put_u16(our.len() as u16);
        hello.put_slice(our);
        w.write_all(&hello).await?;

        let mut len_buf = [0u8; 2];
        r.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut name = vec![0u8; len];
        r.read_exact(&mut name).await?;
        let peer = NodeId::new(String::from_utf8_lossy(&name).into_owned());

        let link_id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        // A dial crossing an accept for the same peer replaces the older
        // link; the replaced writer exits when its channel closes and its
        // teardown is a no-op because the link id no longer matches.
        let was_up = self.conns.insert(peer.clone(), Conn { link_id, tx }).is_some();
        if !was_up {
            self.emit(MembershipEvent::NodeUp(peer.clone()));
        }
        info!(node = %self.node, peer = %peer, "link up");

        let writer = self.clone();
        let wpeer = peer.clone();
        tokio::spawn(async move {
            writer.write_loop(rx, &mut w).await;
            writer.teardown(&wpeer, link_id);
        });

        let reader = self.clone();
        tokio::spawn(async move {
            if let Err(e) = reader.read_loop(&mut r).await {
                debug!(node = %reader.node, peer = %peer, error = %e, "link closed");
            }
            reader.teardown(&peer, link_id);
        });

        Ok(())
    }

    async fn write_loop(&self, mut rx: mpsc::UnboundedReceiver<Bytes>, w: &mut OwnedWriteHalf) {
        while let Some(frame) = rx.recv().await {
            if w.write_all(&frame).await.is_err() {
                return;
            }
        }
    }

    async fn read_loop(&self, r: &mut OwnedReadHalf) -> std::io::Result<()> {
        loop {
            let mut len_buf = [0u8; 4];
            r.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;
            if len == 0 || len > MAX_FRAME {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "bad frame length",
                ));
            }
            let mut frame = vec![0u8; len];
            r.read_exact(&mut frame).await?;

            let mut cursor = std::io::Cursor::new(&frame);
            let ep_len = cursor.get_u8() as usize;
            if 1 + ep_len > len {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "bad endpoint length",
                ));
            }
            let endpoint = String::from_utf8_lossy(&frame[1..1 + ep_len]).into_owned();
            let payload = Bytes::copy_from_slice(&frame[1 + ep_len..]);

            match self.endpoints.get(&endpoint) {
                Some(sink) => {
                    let _ = sink.send(payload);
                }
                None => warn!(node = %self.node, endpoint, "frame for unbound endpoint"),
            }
        }
    }

    /// Deliberately drop the link to `node`, if any. The peer observes a
    /// normal link close and runs its own teardown.
    pub fn disconnect(&self, node: &NodeId) {
        if self.conns.remove(node).is_none() {
            return;
        }
        info!(node = %self.node, peer = %node, "link dropped");
        self.emit(MembershipEvent::NodeDown(node.clone()));
        self.fire_link_monitors(node);
    }

    /// Remove the link if it is still the registered one, then signal
    /// everyone watching the peer. Both link tasks call this; the loser
    /// finds the entry gone and does nothing.
    fn teardown(&self, peer: &NodeId, link_id: u64) {
        let removed = self
            .conns
            .remove_if(peer, |_, conn| conn.link_id == link_id)
            .is_some();
        if !removed {
            return;
        }
        info!(node = %self.node, peer = %peer, "link down");
        self.emit(MembershipEvent::NodeDown(peer.clone()));
        self.fire_link_monitors(peer);
    }

    fn emit(&self, event: MembershipEvent) {
        let mut subs = self.membership.lock();
        subs.retain(|s| s.send(event.clone()).is_ok());
    }

    fn fire_link_monitors(&self, peer: &NodeId) {
        let fired: Vec<LinkMonitor> = {
            let mut links = self.links.lock();
            let (gone, kept) = links.drain(..).partition(|m| &m.node == peer);
            *links = kept;
            gone
        };
        for m in fired {
            let _ = m.sink.send(Down {
                handle: m.handle,
                principal: PrincipalRef::registrar(m.node),
                reason: ExitReason::Disconnected,
            });
        }
    }
}

impl Transport for TcpTransport {
    fn local_node(&self) -> NodeId {
        self.node.clone()
    }

    fn send_to(&self, node: &NodeId, endpoint: &str, payload: Bytes) {
        let Some(conn) = self.conns.get(node) else {
            debug!(node = %self.node, peer = %node, endpoint, "dropping send, no link");
            return;
        };
        let ep = endpoint.as_bytes();
        let mut frame = BytesMut::with_capacity(4 + 1 + ep.len() + payload.len());
        frame.put_u32((1 + ep.len() + payload.len()) as u32);
        frame.put_u8(ep.len() as u8);
        frame.put_slice(ep);
        frame.put(payload);
        let _ = conn.tx.send(frame.freeze());
    }

    fn bind_endpoint(&self, endpoint: &str, sink: mpsc::UnboundedSender<Bytes>) {
        self.endpoints.insert(endpoint.to_string(), sink);
    }

    fn subscribe_membership(&self, sink: mpsc::UnboundedSender<MembershipEvent>) {
        self.membership.lock().push(sink);
    }

    fn monitor_peer(&self, node: &NodeId, sink: DownSink) -> MonitorHandle {
        let handle = MonitorHandle::next();
        if self.conns.contains_key(node) {
            self.links.lock().push(LinkMonitor {
                handle,
                node: node.clone(),
                sink,
            });
        } else {
            // No link now: report straight away, same as monitoring a
            // principal that is already gone.
            let _ = sink.send(Down {
                handle,
                principal: PrincipalRef::registrar(node.clone()),
                reason: ExitReason::Disconnected,
            });
        }
        handle
    }
}
