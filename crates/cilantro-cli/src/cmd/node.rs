//! `cilantro run`: the long-running node.

use super::{fail, runtime};
use crate::config::node_keys;
use cilantro_types::config::{SocketKindSpec, SocketSpec};
use cilantro_types::NodeConfig;
use cilantro_wire::{
    DirectoryDiscovery, ListenState, Multipart, ReceiveLoop, RouterFilter, SocketManager,
    TopicFilter, TransportSocket, WireResult,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub fn cmd_run(config: NodeConfig) {
    let rt = runtime();
    if let Err(e) = rt.block_on(run_node(config)) {
        error!(error = %e, "Node stopped with an error");
        fail(e);
    }
}

fn log_handler(socket: String) -> impl FnMut(Multipart, Option<&str>) + Send {
    move |frames: Multipart, key: Option<&str>| {
        let header = frames
            .first()
            .map(|h| String::from_utf8_lossy(h).into_owned())
            .unwrap_or_default();
        info!(
            socket = %socket,
            handler = key.unwrap_or("-"),
            frames = frames.len(),
            header = %header,
            "Message received"
        );
    }
}

/// Attach the logging handler and the admission filter the socket kind calls
/// for.
fn receive_loop(
    socket: &Arc<TransportSocket>,
    spec: &SocketSpec,
    config: &NodeConfig,
) -> WireResult<ReceiveLoop> {
    let receive = socket
        .add_handler(log_handler(spec.name.clone()), Some(spec.name.clone()))?
        .with_settings(&config.listener);
    Ok(match spec.kind {
        SocketKindSpec::Router => receive.with_filter(RouterFilter),
        SocketKindSpec::Broadcast if !spec.topics.is_empty() => {
            receive.with_filter(TopicFilter::new(spec.topics.iter().cloned()))
        }
        SocketKindSpec::Broadcast => receive,
    })
}

async fn run_node(config: NodeConfig) -> WireResult<()> {
    let keys = node_keys(&config).unwrap_or_else(|e| fail(e));
    let (discovery, events) = DirectoryDiscovery::with_peers(
        config
            .peers
            .iter()
            .map(|peer| (peer.vk.clone(), peer.ip.clone())),
    );
    let mut manager = SocketManager::new(Arc::new(discovery), config.host_ip.clone());
    match keys {
        Some(keys) => {
            manager.init_security(keys, &config.certs_dir, config.reset_auth)?;
        }
        None if config.sockets.iter().any(|s| s.secure) => {
            warn!("Secure sockets are configured but no signing key is set");
        }
        None => {}
    }

    info!(
        name = %config.name,
        role = %config.role,
        host_ip = %config.host_ip,
        sockets = config.sockets.len(),
        "Starting node"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let overlay = Arc::clone(manager.overlay());
    let pump_shutdown = shutdown_rx.clone();
    let mut pump = tokio::spawn(async move { overlay.run(events, pump_shutdown).await });

    let mut sockets = Vec::with_capacity(config.sockets.len());
    let mut loops = JoinSet::new();
    for spec in &config.sockets {
        let socket = manager.open(spec)?;
        let receive = receive_loop(&socket, spec, &config)?;
        loops.spawn(receive.run(shutdown_rx.clone()));
        sockets.push(socket);
    }
    if sockets.is_empty() {
        warn!("No sockets configured; the node only serves discovery events");
    }

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            Ok(())
        }
        joined = &mut pump => match joined {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Overlay event pump panicked");
                Ok(())
            }
        },
    };

    let _ = shutdown_tx.send(true);
    while let Some(joined) = loops.join_next().await {
        match joined {
            Ok(ListenState::Faulted) => warn!("Receive loop gave up after repeated faults"),
            Ok(state) => info!(state = ?state, "Receive loop finished"),
            Err(e) => error!(error = %e, "Receive loop panicked"),
        }
    }
    for socket in &sockets {
        socket.close();
    }
    pump.abort();
    info!("Node stopped");
    outcome
}
