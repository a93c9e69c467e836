//! `cilantro send`: one-shot test client.

use super::{fail, runtime};
use crate::cli::SendArgs;
use crate::config::require_node_keys;
use bytes::Bytes;
use cilantro_types::config::{SocketKindSpec, SocketMode, SocketSpec};
use cilantro_types::NodeConfig;
use cilantro_wire::message::three_frame;
use cilantro_wire::{DirectoryDiscovery, SocketManager, WireError, WireResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Time left for the connection task to flush the message before the socket
/// is closed.
const LINGER: Duration = Duration::from_millis(200);

pub fn cmd_send(config: NodeConfig, args: SendArgs) {
    if args.ip.is_none() && args.vk.is_none() {
        fail("either --ip or --vk is required");
    }
    if args.secure && args.vk.is_none() {
        fail("--secure needs the peer's --vk");
    }
    let kind = SocketKindSpec::from(args.kind);
    if kind == SocketKindSpec::Router && args.to.is_none() {
        fail("router sockets need a destination identity (--to)");
    }

    let rt = runtime();
    match rt.block_on(send_once(config, args)) {
        Ok(()) => println!("Message sent"),
        Err(e) => fail(e),
    }
}

async fn send_once(config: NodeConfig, args: SendArgs) -> WireResult<()> {
    let (discovery, events) = DirectoryDiscovery::with_peers(
        config
            .peers
            .iter()
            .map(|peer| (peer.vk.clone(), peer.ip.clone())),
    );
    let mut manager = SocketManager::new(Arc::new(discovery), config.host_ip.clone());
    if args.secure {
        let keys = require_node_keys(&config).unwrap_or_else(|e| fail(e));
        manager.init_security(keys, &config.certs_dir, false)?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let overlay = Arc::clone(manager.overlay());
    tokio::spawn(async move { overlay.run(events, shutdown_rx).await });

    let spec = SocketSpec {
        name: "send".to_string(),
        kind: SocketKindSpec::from(args.kind),
        mode: SocketMode::Connect,
        port: args.port,
        protocol: args.protocol.clone(),
        ip: args.ip.clone().unwrap_or_default(),
        vk: args.vk.clone().unwrap_or_default(),
        domain: args.domain.clone(),
        secure: args.secure,
        topics: Vec::new(),
    };
    let socket = manager.open(&spec)?;

    let connected = tokio::time::timeout(Duration::from_secs(args.timeout), async {
        while socket.peer_count() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if connected.is_err() {
        socket.close();
        return Err(WireError::Transport(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no connection within {}s", args.timeout),
        )));
    }

    let mut frames = three_frame(args.header, args.msg_type, args.payload);
    if let Some(to) = args.to {
        frames.insert(0, Bytes::from(to));
    }
    info!(frames = frames.len(), endpoints = ?socket.active_connections(), "Sending");
    socket.send_multipart(frames)?;

    tokio::time::sleep(LINGER).await;
    socket.close();
    let _ = shutdown_tx.send(true);
    Ok(())
}
