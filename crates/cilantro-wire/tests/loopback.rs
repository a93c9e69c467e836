//! End-to-end tests over real loopback sockets, with discovery answered by
//! an in-process directory.

use cilantro_types::config::{SocketMode, SocketSpec};
use cilantro_wire::{
    DirectoryDiscovery, Endpoint, Multipart, NodeKeys, OverlayEvent, SocketManager,
    TransportSocket,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn frames(parts: &[&'static str]) -> Multipart {
    parts
        .iter()
        .map(|p| bytes::Bytes::from_static(p.as_bytes()))
        .collect()
}

/// A node: manager, discovery directory and running overlay pump.
struct Node {
    manager: SocketManager,
    discovery: Arc<DirectoryDiscovery>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    fn new() -> Self {
        let (discovery, events) = DirectoryDiscovery::new();
        let discovery = Arc::new(discovery);
        // Deliberately not a local address, so descriptors keep their ip.
        let manager = SocketManager::new(discovery.clone(), "10.255.0.1");
        let (shutdown, rx) = watch::channel(false);
        Self::spawn_pump(&manager, events, rx);
        Self {
            manager,
            discovery,
            shutdown,
        }
    }

    fn spawn_pump(
        manager: &SocketManager,
        events: mpsc::UnboundedReceiver<OverlayEvent>,
        shutdown: watch::Receiver<bool>,
    ) {
        let overlay = Arc::clone(manager.overlay());
        tokio::spawn(async move { overlay.run(events, shutdown).await });
    }

    /// Forward everything the socket receives into a channel.
    fn collect(&self, socket: &Arc<TransportSocket>) -> mpsc::UnboundedReceiver<Multipart> {
        let (tx, rx) = mpsc::unbounded_channel();
        let receive = socket
            .add_handler(
                move |frames: Multipart, _key: Option<&str>| {
                    let _ = tx.send(frames);
                },
                None,
            )
            .unwrap();
        tokio::spawn(receive.run(self.shutdown.subscribe()));
        rx
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn bind_spec(name: &str, ip: &str, port: u16) -> SocketSpec {
    SocketSpec {
        name: name.into(),
        mode: SocketMode::Bind,
        ip: ip.into(),
        port,
        ..SocketSpec::default()
    }
}

fn connect_by_vk(name: &str, vk: &str, port: u16) -> SocketSpec {
    SocketSpec {
        name: name.into(),
        mode: SocketMode::Connect,
        vk: vk.into(),
        port,
        ..SocketSpec::default()
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Multipart>) -> Multipart {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("receive loop ended")
}

#[tokio::test]
async fn test_connect_by_verifying_key_delivers() {
    let port = free_port();
    let server = Node::new();
    let publisher = server
        .manager
        .open(&bind_spec("inbox", "127.0.0.1", port))
        .unwrap();
    let mut inbox = server.collect(&publisher);

    let client = Node::new();
    client.discovery.insert("vk-server", "127.0.0.1");
    let socket = client
        .manager
        .open(&connect_by_vk("outbox", "vk-server", port))
        .unwrap();

    let expected = Endpoint::parse(&format!("tcp://127.0.0.1:{port}")).unwrap();
    eventually("the lookup to resolve", || socket.is_active(&expected)).await;
    assert_eq!(socket.pending_lookup_count(), 0);
    assert_eq!(client.manager.overlay().pending_count(), 0);
    assert_eq!(socket.active_connections().len(), 1);

    eventually("the peer to connect", || socket.peer_count() >= 1).await;
    socket.send("blocks", "new", "42").unwrap();
    assert_eq!(recv(&mut inbox).await, frames(&["blocks", "new", "42"]));
}

#[tokio::test]
async fn test_unknown_verifying_key_stays_tracked() {
    let client = Node::new();
    let socket = client
        .manager
        .open(&connect_by_vk("outbox", "vk-nobody", free_port()))
        .unwrap();

    eventually("the lookup to fail", || socket.pending_lookup_count() == 0).await;
    assert!(socket.active_connections().is_empty());
    assert_eq!(socket.tracked_peer_count(), 1);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_reconnects_when_peer_reappears() {
    let port = free_port();
    let first = Node::new();
    let old = first
        .manager
        .open(&bind_spec("inbox", "127.0.0.1", port))
        .unwrap();

    let client = Node::new();
    client.discovery.insert("vk-server", "127.0.0.1");
    let socket = client
        .manager
        .open(&connect_by_vk("outbox", "vk-server", port))
        .unwrap();
    eventually("the first connection", || socket.peer_count() >= 1).await;

    old.close();
    drop(old);
    eventually("the old peer to go away", || socket.peer_count() == 0).await;

    let second = Node::new();
    let moved = second
        .manager
        .open(&bind_spec("inbox", "127.0.0.2", port))
        .unwrap();
    let mut inbox = second.collect(&moved);
    client.discovery.announce_online("vk-server", "127.0.0.2").unwrap();

    let new_endpoint = Endpoint::parse(&format!("tcp://127.0.0.2:{port}")).unwrap();
    let old_endpoint = Endpoint::parse(&format!("tcp://127.0.0.1:{port}")).unwrap();
    eventually("the reconnect", || socket.is_active(&new_endpoint)).await;
    assert!(!socket.is_active(&old_endpoint));

    eventually("the new peer", || socket.peer_count() >= 1).await;
    socket.send("blocks", "new", "43").unwrap();
    assert_eq!(recv(&mut inbox).await, frames(&["blocks", "new", "43"]));
}

struct SecureNode {
    node: Node,
    keys: Arc<NodeKeys>,
    _certs: tempfile::TempDir,
}

fn secure_node() -> SecureNode {
    let certs = tempfile::tempdir().unwrap();
    let mut node = Node::new();
    let keys = node
        .manager
        .init_security(NodeKeys::generate(), certs.path(), false)
        .unwrap();
    SecureNode {
        node,
        keys,
        _certs: certs,
    }
}

fn secure_connect(vk: &str, port: u16) -> SocketSpec {
    SocketSpec {
        name: "outbox".into(),
        mode: SocketMode::Connect,
        ip: "127.0.0.1".into(),
        vk: vk.into(),
        port,
        secure: true,
        ..SocketSpec::default()
    }
}

#[tokio::test]
async fn test_secure_bind_admits_authorized_peer() {
    let port = free_port();
    let server = secure_node();
    let client = secure_node();
    server
        .node
        .manager
        .auth_store()
        .unwrap()
        .authorize_vk(&client.keys.verifying_key_hex(), "*")
        .unwrap();

    let bound = server
        .node
        .manager
        .open(&SocketSpec {
            secure: true,
            ..bind_spec("inbox", "127.0.0.1", port)
        })
        .unwrap();
    let mut inbox = server.node.collect(&bound);

    let socket = client
        .node
        .manager
        .open(&secure_connect(&server.keys.verifying_key_hex(), port))
        .unwrap();
    eventually("the secure handshake", || socket.peer_count() >= 1).await;

    socket.send("tx", "submit", "sealed").unwrap();
    assert_eq!(recv(&mut inbox).await, frames(&["tx", "submit", "sealed"]));
}

#[tokio::test]
async fn test_secure_bind_rejects_unknown_peer() {
    let port = free_port();
    let server = secure_node();
    let stranger = secure_node();

    let bound = server
        .node
        .manager
        .open(&SocketSpec {
            secure: true,
            ..bind_spec("inbox", "127.0.0.1", port)
        })
        .unwrap();
    let _inbox = server.node.collect(&bound);

    let socket = stranger
        .node
        .manager
        .open(&secure_connect(&server.keys.verifying_key_hex(), port))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(socket.peer_count(), 0);
    assert_eq!(bound.peer_count(), 0);
}
