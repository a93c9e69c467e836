//! Address resolution through the overlay discovery service.
//!
//! Sockets address peers by verifying key. The [`OverlayClient`] asks a
//! [`Discovery`] backend to resolve a key, remembers which socket asked, and
//! routes the answer back to exactly that socket when the backend replies on
//! its event channel. Online announcements are fanned out to every socket
//! that has tried to reach the announced peer.

use crate::error::{WireError, WireResult};
use crate::socket::TransportSocket;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Opaque token correlating a resolution request with its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolutionId(String);

impl ResolutionId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ResolutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for ResolutionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ResolutionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ResolutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Events published by the discovery service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    /// A resolution request succeeded.
    GotIp {
        event_id: ResolutionId,
        vk: String,
        ip: String,
    },
    /// A resolution request failed; the key is unknown to the overlay.
    NotFound { event_id: ResolutionId, vk: String },
    /// A peer came (back) online at `ip`.
    NodeOnline { vk: String, ip: String },
}

/// The external discovery service.
///
/// `resolve` returns immediately with a request id; the answer arrives later
/// as an [`OverlayEvent`] carrying the same id.
pub trait Discovery: Send + Sync {
    fn resolve(&self, vk: &str) -> WireResult<ResolutionId>;
}

type SocketRef = Weak<TransportSocket>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Node-wide client of the discovery service, shared by every socket.
pub struct OverlayClient {
    discovery: Arc<dyn Discovery>,
    /// Outstanding resolutions and the socket awaiting each.
    pending: Mutex<HashMap<ResolutionId, SocketRef>>,
    /// Sockets interested in online events, per verifying key.
    watchers: Mutex<HashMap<String, Vec<SocketRef>>>,
}

impl OverlayClient {
    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        Self {
            discovery,
            pending: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Ask the discovery service for `vk` on behalf of `socket`.
    ///
    /// The socket is also subscribed to online events for `vk`. A request id
    /// that is already outstanding is a [`WireError::Configuration`] error.
    pub fn resolve(&self, vk: &str, socket: SocketRef) -> WireResult<ResolutionId> {
        // Held across the backend call so a fast reply cannot overtake the
        // registration.
        let mut pending = lock(&self.pending);
        let id = self.discovery.resolve(vk)?;
        if pending.contains_key(&id) {
            return Err(WireError::Configuration(format!(
                "resolution id {id} is already outstanding"
            )));
        }
        pending.insert(id.clone(), socket.clone());
        drop(pending);

        self.watch(vk, socket);
        debug!(vk, id = %id, "Resolution requested");
        Ok(id)
    }

    /// Subscribe `socket` to online events for `vk`.
    pub fn watch(&self, vk: &str, socket: SocketRef) {
        let mut watchers = lock(&self.watchers);
        let entry = watchers.entry(vk.to_string()).or_default();
        entry.retain(|w| w.strong_count() > 0);
        if !entry.iter().any(|w| w.ptr_eq(&socket)) {
            entry.push(socket);
        }
    }

    /// Number of outstanding resolutions.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    fn take_pending(&self, id: &ResolutionId) -> WireResult<SocketRef> {
        lock(&self.pending).remove(id).ok_or_else(|| {
            WireError::Configuration(format!("no socket is awaiting resolution {id}"))
        })
    }

    /// Route one event to the socket(s) it concerns.
    ///
    /// Only a reply id nobody is waiting for is an error. A socket that fails
    /// to replay its command is logged and left to its owner; other sockets
    /// sharing this client are unaffected.
    pub fn dispatch(&self, event: OverlayEvent) -> WireResult<()> {
        match event {
            OverlayEvent::GotIp { event_id, vk, ip } => {
                match self.take_pending(&event_id)?.upgrade() {
                    Some(socket) => {
                        if let Err(e) = socket.on_resolved(&event_id, &ip) {
                            warn!(
                                socket = %socket.name(),
                                vk,
                                id = %event_id,
                                error = %e,
                                "Socket failed to replay resolved command"
                            );
                        }
                    }
                    None => {
                        debug!(vk, id = %event_id, "Resolved peer for a socket that is gone");
                    }
                }
                Ok(())
            }
            OverlayEvent::NotFound { event_id, vk } => {
                if let Some(socket) = self.take_pending(&event_id)?.upgrade() {
                    if let Err(e) = socket.on_unresolvable(&event_id, &vk) {
                        warn!(
                            socket = %socket.name(),
                            vk,
                            id = %event_id,
                            error = %e,
                            "Socket failed to handle unresolvable peer"
                        );
                    }
                }
                Ok(())
            }
            OverlayEvent::NodeOnline { vk, ip } => {
                let sockets: Vec<Arc<TransportSocket>> = {
                    let mut watchers = lock(&self.watchers);
                    match watchers.get_mut(&vk) {
                        Some(entry) => {
                            entry.retain(|w| w.strong_count() > 0);
                            entry.iter().filter_map(Weak::upgrade).collect()
                        }
                        None => Vec::new(),
                    }
                };
                debug!(vk, ip, sockets = sockets.len(), "Peer online");
                for socket in sockets {
                    socket.on_peer_online(&vk, &ip);
                }
                Ok(())
            }
        }
    }

    /// Pump discovery events until shutdown or until the event channel
    /// closes. Stops with the error if an event reveals a contract violation.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<OverlayEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> WireResult<()> {
        info!("Overlay event pump started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.dispatch(event) {
                            if e.is_fatal() {
                                error!(error = %e, "Overlay event violated the resolution contract");
                                return Err(e);
                            }
                            error!(error = %e, "Failed to apply overlay event");
                        }
                    }
                    None => {
                        info!("Overlay event channel closed");
                        return Ok(());
                    }
                },
                _ = shutdown.changed() => {
                    info!("Overlay event pump stopped");
                    return Ok(());
                }
            }
        }
    }
}

impl fmt::Debug for OverlayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayClient")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

/// In-process discovery backed by a static verifying key to IP directory.
///
/// Replies are delivered through the event channel returned by
/// [`DirectoryDiscovery::new`], never synchronously.
pub struct DirectoryDiscovery {
    directory: RwLock<HashMap<String, String>>,
    events: mpsc::UnboundedSender<OverlayEvent>,
}

impl DirectoryDiscovery {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OverlayEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                directory: RwLock::new(HashMap::new()),
                events,
            },
            rx,
        )
    }

    /// Directory pre-seeded with `(vk, ip)` pairs.
    pub fn with_peers<I>(peers: I) -> (Self, mpsc::UnboundedReceiver<OverlayEvent>)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let (discovery, rx) = Self::new();
        {
            let mut directory = discovery
                .directory
                .write()
                .unwrap_or_else(|e| e.into_inner());
            directory.extend(peers);
        }
        (discovery, rx)
    }

    /// Record a peer address without announcing it.
    pub fn insert(&self, vk: impl Into<String>, ip: impl Into<String>) {
        self.directory
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(vk.into(), ip.into());
    }

    pub fn remove(&self, vk: &str) {
        self.directory
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(vk);
    }

    pub fn lookup(&self, vk: &str) -> Option<String> {
        self.directory
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(vk)
            .cloned()
    }

    /// Record a peer address and publish a [`OverlayEvent::NodeOnline`].
    pub fn announce_online(&self, vk: &str, ip: &str) -> WireResult<()> {
        self.insert(vk, ip);
        self.publish(OverlayEvent::NodeOnline {
            vk: vk.to_string(),
            ip: ip.to_string(),
        })
    }

    fn publish(&self, event: OverlayEvent) -> WireResult<()> {
        self.events.send(event).map_err(|_| {
            WireError::Configuration("the overlay event pump is not running".into())
        })
    }
}

impl Discovery for DirectoryDiscovery {
    fn resolve(&self, vk: &str) -> WireResult<ResolutionId> {
        let event_id = ResolutionId::new();
        let event = match self.lookup(vk) {
            Some(ip) => OverlayEvent::GotIp {
                event_id: event_id.clone(),
                vk: vk.to_string(),
                ip,
            },
            None => OverlayEvent::NotFound {
                event_id: event_id.clone(),
                vk: vk.to_string(),
            },
        };
        self.publish(event)?;
        Ok(event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_replies_on_channel() {
        let (discovery, mut rx) =
            DirectoryDiscovery::with_peers([("vk-a".to_string(), "10.0.0.1".to_string())]);

        let found = discovery.resolve("vk-a").unwrap();
        match rx.try_recv().unwrap() {
            OverlayEvent::GotIp { event_id, vk, ip } => {
                assert_eq!(event_id, found);
                assert_eq!(vk, "vk-a");
                assert_eq!(ip, "10.0.0.1");
            }
            other => panic!("Expected GotIp, got {other:?}"),
        }

        let missing = discovery.resolve("vk-b").unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            OverlayEvent::NotFound {
                event_id: missing,
                vk: "vk-b".into()
            }
        );
    }

    #[test]
    fn test_announce_updates_directory() {
        let (discovery, mut rx) = DirectoryDiscovery::new();
        discovery.announce_online("vk-a", "10.0.0.9").unwrap();
        assert_eq!(discovery.lookup("vk-a").as_deref(), Some("10.0.0.9"));
        assert_eq!(
            rx.try_recv().unwrap(),
            OverlayEvent::NodeOnline {
                vk: "vk-a".into(),
                ip: "10.0.0.9".into()
            }
        );
        discovery.remove("vk-a");
        assert!(discovery.lookup("vk-a").is_none());
    }

    #[test]
    fn test_stopped_pump_is_configuration_error() {
        let (discovery, rx) = DirectoryDiscovery::new();
        drop(rx);
        assert!(matches!(
            discovery.resolve("vk-a"),
            Err(WireError::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_reply_id_is_rejected() {
        let (discovery, _rx) = DirectoryDiscovery::new();
        let overlay = OverlayClient::new(Arc::new(discovery));
        let result = overlay.dispatch(OverlayEvent::GotIp {
            event_id: "never-issued".into(),
            vk: "vk".into(),
            ip: "10.0.0.1".into(),
        });
        assert!(matches!(result, Err(WireError::Configuration(_))));
    }

    #[test]
    fn test_online_for_unwatched_key_is_noop() {
        let (discovery, _rx) = DirectoryDiscovery::new();
        let overlay = OverlayClient::new(Arc::new(discovery));
        overlay
            .dispatch(OverlayEvent::NodeOnline {
                vk: "vk".into(),
                ip: "10.0.0.1".into(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (discovery, rx) = DirectoryDiscovery::new();
        let overlay = Arc::new(OverlayClient::new(Arc::new(discovery)));
        let (tx, shutdown) = watch::channel(false);
        let pump = {
            let overlay = Arc::clone(&overlay);
            tokio::spawn(async move { overlay.run(rx, shutdown).await })
        };
        tx.send(true).unwrap();
        assert!(pump.await.unwrap().is_ok());
    }
}
