// tests/cluster.rs
//! Multi-node registry behavior over the in-process mesh.

use argus::{
    MeshNet, Meta, Node, NodeId, PeerMsg, PrincipalRef, Priority, Transport, REGISTRAR_ENDPOINT,
};
use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
});

/// Poll `cond` until it holds or the deadline passes.
async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Start a node on the mesh and attach it.
fn start(net: &MeshNet, id: &str) -> Node {
    Lazy::force(&TRACING);
    let node = Node::new(net.transport(id));
    net.connect(&NodeId::new(id));
    node
}

/// Start a node whose transport exists but is not yet attached.
fn start_detached(net: &MeshNet, id: &str) -> Node {
    Lazy::force(&TRACING);
    Node::new(net.transport(id))
}

/// A principal that ignores its messages.
fn idle(node: &Node) -> PrincipalRef {
    node.spawn(|_| async {})
}

/// A principal that records every payload it receives.
fn recorder(node: &Node) -> (PrincipalRef, Arc<Mutex<Vec<Bytes>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let principal = node.spawn(move |payload| {
        let sink = sink.clone();
        async move {
            sink.lock().push(payload);
        }
    });
    (principal, seen)
}

fn meta(k: &str, v: &str) -> Meta {
    let mut m = Meta::new();
    m.insert(k.to_string(), v.to_string());
    m
}

#[tokio::test]
async fn whereis_immediately_after_register() {
    let net = MeshNet::new();
    let a = start(&net, "a");
    let p = idle(&a);

    assert!(a.register_name("x", p.clone()).await);
    assert_eq!(a.whereis_name("x"), Some(p));
}

#[tokio::test]
async fn second_registration_of_same_name_is_rejected() {
    let net = MeshNet::new();
    let a = start(&net, "a");
    let p1 = idle(&a);
    let p2 = idle(&a);

    assert!(a.register_name("x", p1.clone()).await);
    assert!(!a.register_name("x", p2).await);
    assert_eq!(a.whereis_name("x"), Some(p1));
}

#[tokio::test]
async fn registration_of_remote_principal_is_rejected() {
    let net = MeshNet::new();
    let a = start(&net, "a");
    let b = start(&net, "b");
    let p_b = idle(&b);

    assert!(!a.register_name("x", p_b).await);
    assert_eq!(a.whereis_name("x"), None);
}

#[tokio::test]
async fn propagation_to_connected_peers() {
    // S1: a registration on one node becomes visible on every peer.
    let net = MeshNet::new();
    let a = start(&net, "a");
    let b = start(&net, "b");
    let c = start(&net, "c");
    let p = idle(&a);

    assert!(a.register_name("x", p.clone()).await);
    assert!(wait_until(|| b.whereis_name("x") == Some(p.clone())).await);
    assert!(wait_until(|| c.whereis_name("x") == Some(p.clone())).await);
}

#[tokio::test]
async fn register_unregister_round_trip() {
    let net = MeshNet::new();
    let a = start(&net, "a");
    let b = start(&net, "b");
    let p = idle(&a);

    assert!(a.register_name("x", p.clone()).await);
    assert!(wait_until(|| b.whereis_name("x").is_some()).await);

    a.unregister_name("x").await;
    assert_eq!(a.whereis_name("x"), None);
    assert!(wait_until(|| b.whereis_name("x").is_none()).await);
    assert!(a.registered_names().is_empty());
    assert!(b.registered_names().is_empty());
}

#[tokio::test]
async fn unregister_of_foreign_or_missing_name_is_a_noop() {
    let net = MeshNet::new();
    let a = start(&net, "a");
    let b = start(&net, "b");
    let p = idle(&a);

    assert!(a.register_name("x", p.clone()).await);
    assert!(wait_until(|| b.whereis_name("x").is_some()).await);

    // b does not own "x"; the call is advisory and changes nothing.
    b.unregister_name("x").await;
    b.unregister_name("missing").await;
    assert_eq!(b.whereis_name("x"), Some(p.clone()));
    assert_eq!(a.whereis_name("x"), Some(p));
}

#[tokio::test]
async fn meta_updates_flow_from_the_home_node_only() {
    // S2: owner meta updates propagate; a foreign set_meta is rejected
    // and leaves every replica untouched.
    let net = MeshNet::new();
    let a = start(&net, "a");
    let b = start(&net, "b");
    let c = start(&net, "c");
    let p = idle(&a);

    assert!(a.register_name("x", p).await);
    assert!(a.set_meta("x", meta("k", "1")).await);

    let converged = |node: &Node| {
        let node = node.clone();
        move || node_meta(&node, "x") == Some(meta("k", "1"))
    };
    assert!(wait_until(converged(&b)).await);
    assert!(wait_until(converged(&c)).await);

    // Not the home node: distinct rejection, no state change anywhere.
    assert!(!b.set_meta("x", meta("k", "2")).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    for node in [&a, &b, &c] {
        assert_eq!(node_meta(node, "x"), Some(meta("k", "1")));
    }
}

/// Meta of a binding as this node currently sees it.
fn node_meta(node: &Node, name: &str) -> Option<Meta> {
    node.lookup(name).map(|b| b.meta)
}

#[tokio::test]
async fn set_meta_is_idempotent() {
    let net = MeshNet::new();
    let a = start(&net, "a");
    let p = idle(&a);

    assert!(a.register_name("x", p).await);
    assert!(a.set_meta("x", meta("k", "1")).await);
    assert!(a.set_meta("x", meta("k", "1")).await);
    assert_eq!(node_meta(&a, "x"), Some(meta("k", "1")));
}

#[tokio::test]
async fn late_joiner_syncs_existing_bindings() {
    // S3: a node that connects after the fact pulls the full snapshot,
    // meta included.
    let net = MeshNet::new();
    let a = start(&net, "a");
    let b = start(&net, "b");
    let p = idle(&a);

    assert!(a.register_name("x", p.clone()).await);
    assert!(a.set_meta("x", meta("k", "1")).await);
    assert!(wait_until(|| b.whereis_name("x").is_some()).await);

    let c = start_detached(&net, "c");
    assert_eq!(c.whereis_name("x"), None);

    net.connect(&NodeId::new("c"));
    assert!(wait_until(|| c.whereis_name("x") == Some(p.clone())).await);
    assert!(wait_until(|| node_meta(&c, "x") == Some(meta("k", "1"))).await);
}

#[tokio::test]
async fn principal_failure_unregisters_everywhere() {
    // S4: the principal dies; its name disappears locally and on peers.
    let net = MeshNet::new();
    let a = start(&net, "a");
    let b = start(&net, "b");
    let p = idle(&a);

    assert!(a.register_name("x", p.clone()).await);
    assert!(wait_until(|| b.whereis_name("x").is_some()).await);

    a.kill(&p);
    assert!(wait_until(|| a.whereis_name("x").is_none()).await);
    assert!(wait_until(|| b.whereis_name("x").is_none()).await);
}

#[tokio::test]
async fn peer_failure_purges_its_bindings() {
    // S5: from b's perspective a goes down; a's entries vanish from b
    // while a's own table is untouched.
    let net = MeshNet::new();
    let a = start(&net, "a");
    let b = start(&net, "b");
    let p = idle(&a);
    let p_b = idle(&b);

    assert!(a.register_name("x", p.clone()).await);
    assert!(b.register_name("y", p_b).await);
    assert!(wait_until(|| b.whereis_name("x").is_some()).await);
    assert!(wait_until(|| a.whereis_name("y").is_some()).await);

    net.part(&NodeId::new("a"));
    assert!(wait_until(|| b.whereis_name("x").is_none()).await);
    assert!(wait_until(|| a.whereis_name("y").is_none()).await);
    assert_eq!(a.whereis_name("x"), Some(p));
    assert!(b.whereis_name("y").is_some());
}

#[tokio::test]
async fn concurrent_registration_clash_resolves_to_smaller_node() {
    // S6: both sides registered "x" while apart; on contact the binding
    // from the smaller node wins everywhere and the loser is terminated.
    let net = MeshNet::new();
    let a = start_detached(&net, "a");
    let c = start_detached(&net, "c");
    let p_a = idle(&a);
    let p_c = idle(&c);

    assert!(a.register_name("x", p_a.clone()).await);
    assert!(c.register_name("x", p_c.clone()).await);

    net.connect(&NodeId::new("a"));
    net.connect(&NodeId::new("c"));

    assert!(wait_until(|| c.whereis_name("x") == Some(p_a.clone())).await);
    assert_eq!(a.whereis_name("x"), Some(p_a.clone()));
    assert!(wait_until(|| !c.is_alive(&p_c)).await);
    assert!(a.is_alive(&p_a));
}

#[tokio::test]
async fn send_reaches_remote_principals_and_drops_on_miss() {
    let net = MeshNet::new();
    let a = start(&net, "a");
    let b = start(&net, "b");
    let (p, seen) = recorder(&a);

    assert!(a.register_name("echo", p).await);
    assert!(wait_until(|| b.whereis_name("echo").is_some()).await);

    b.send("echo", Bytes::from_static(b"over the wire"));
    a.send("echo", Bytes::from_static(b"local"));
    // Unbound name: silently dropped.
    b.send("nobody", Bytes::from_static(b"void"));

    assert!(wait_until(|| seen.lock().len() == 2).await);
    let got = seen.lock().clone();
    assert!(got.contains(&Bytes::from_static(b"over the wire")));
    assert!(got.contains(&Bytes::from_static(b"local")));
}

#[tokio::test]
async fn enumeration_reads_split_local_and_remote() {
    let net = MeshNet::new();
    let a = start(&net, "a");
    let b = start(&net, "b");
    let p_a = idle(&a);
    let p_b = idle(&b);

    assert!(a.register_name("mine", p_a.clone()).await);
    assert!(b.register_name("theirs", p_b).await);
    assert!(wait_until(|| a.whereis_name("theirs").is_some()).await);

    assert_eq!(a.local_registered_names(), vec!["mine".to_string()]);
    let mut all = a.registered_names();
    all.sort();
    assert_eq!(all, vec!["mine".to_string(), "theirs".to_string()]);

    let local = a.local_registered_info();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].1, p_a);

    assert_eq!(a.registered_info().len(), 2);
}

#[tokio::test]
async fn notifications_from_a_stranger_are_dropped() {
    let net = MeshNet::new();
    let a = start(&net, "a");
    let b = start(&net, "b");
    let p = idle(&a);

    assert!(a.register_name("x", p.clone()).await);
    assert!(a.set_meta("x", meta("k", "1")).await);
    assert!(wait_until(|| b.whereis_name("x").is_some()).await);

    // "z" is routable on the mesh but runs no registrar, so it never
    // completes a sync handshake and stays out of every peer set.
    let z = NodeId::new("z");
    let tz = net.transport("z");
    net.connect(&z);

    let ghost = PrincipalRef::new(99, z.clone());
    let forged = [
        PeerMsg::Register { from: z.clone(), name: "ghost".into(), principal: ghost },
        PeerMsg::Unregister { from: z.clone(), name: "x".into() },
        PeerMsg::AddMeta { from: z.clone(), name: "x".into(), meta: meta("k", "0") },
    ];
    for msg in &forged {
        tz.send_to(&a.local_node(), REGISTRAR_ENDPOINT, msg.encode().expect("encode"));
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(a.whereis_name("ghost"), None);
    assert_eq!(a.whereis_name("x"), Some(p));
    assert_eq!(node_meta(&a, "x"), Some(meta("k", "1")));
}

#[tokio::test]
async fn priority_knob_is_accepted() {
    let net = MeshNet::new();
    let a = start(&net, "a");
    let p = idle(&a);

    a.set_priority(Priority::High);
    assert!(a.register_name("x", p).await);
    a.set_priority(Priority::Low);
    assert!(a.whereis_name("x").is_some());
}
