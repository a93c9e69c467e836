//! Socket factory holding the node-wide collaborators.

use crate::auth::{AuthStore, Authorizer};
use crate::command::ConnectArgs;
use crate::error::{WireError, WireResult};
use crate::frame_socket::{FrameSocket, SocketKind};
use crate::identity::{IdentityProvider, KeyRing, NodeKeys};
use crate::overlay::{Discovery, OverlayClient};
use crate::raw::RawSocket;
use crate::socket::{SocketContext, SocketIdentity, TransportSocket};
use cilantro_types::config::{SocketMode, SocketSpec};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Creates transport sockets that share one overlay client, key ring and
/// authorization store.
pub struct SocketManager {
    overlay: Arc<OverlayClient>,
    keys: Arc<KeyRing>,
    auth: Option<Arc<AuthStore>>,
    host_ip: String,
}

impl SocketManager {
    /// A manager without identity keys. Secure sockets fail until
    /// [`Self::init_security`] runs.
    pub fn new(discovery: Arc<dyn Discovery>, host_ip: impl Into<String>) -> Self {
        Self {
            overlay: Arc::new(OverlayClient::new(discovery)),
            keys: Arc::new(KeyRing::new()),
            auth: None,
            host_ip: host_ip.into(),
        }
    }

    /// Install the node's keys and open its authorization store.
    pub fn init_security(
        &mut self,
        keys: NodeKeys,
        certs_dir: &Path,
        reset: bool,
    ) -> WireResult<Arc<NodeKeys>> {
        let store = AuthStore::open(certs_dir, &keys, reset)?;
        info!(
            vk = %keys.verifying_key_hex(),
            certs = %store.base_dir().display(),
            "Node identity initialized"
        );
        self.auth = Some(Arc::new(store));
        Ok(self.keys.initialize(keys))
    }

    pub fn overlay(&self) -> &Arc<OverlayClient> {
        &self.overlay
    }

    pub fn keys(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    pub fn auth_store(&self) -> Option<&Arc<AuthStore>> {
        self.auth.as_ref()
    }

    pub fn host_ip(&self) -> &str {
        &self.host_ip
    }

    fn context(&self) -> SocketContext {
        SocketContext {
            overlay: Arc::clone(&self.overlay),
            keys: self.keys.clone(),
            authorizer: self
                .auth
                .as_ref()
                .map(|store| Arc::clone(store) as Arc<dyn Authorizer>),
            host_ip: self.host_ip.clone(),
        }
    }

    /// Wrap an existing raw socket.
    pub fn create_socket(
        &self,
        raw: Box<dyn RawSocket>,
        identity: SocketIdentity,
    ) -> Arc<TransportSocket> {
        TransportSocket::new(identity, raw, self.context())
    }

    /// Identity announced by frame sockets: the verifying key once the node
    /// has keys, otherwise `fallback`.
    pub fn wire_identity(&self, fallback: &str) -> String {
        self.keys
            .node_keys()
            .map(|keys| keys.verifying_key_hex())
            .unwrap_or_else(|_| fallback.to_string())
    }

    /// Create a frame socket from a config entry and issue its bind or
    /// connect.
    pub fn open(&self, spec: &SocketSpec) -> WireResult<Arc<TransportSocket>> {
        let mut identity = SocketIdentity::new(&spec.name);
        if spec.secure {
            identity = identity.secure(&spec.domain);
        }
        let raw = FrameSocket::new(SocketKind::from(spec.kind), self.wire_identity(&spec.name));
        let socket = self.create_socket(Box::new(raw), identity);

        let args = ConnectArgs::with_protocol(spec.port, &spec.protocol)?
            .ip(spec.ip.clone())
            .vk(spec.vk.clone());
        let issued = match spec.mode {
            SocketMode::Bind => socket.bind(args),
            SocketMode::Connect => socket.connect(args),
        };
        issued.map_err(|e| match e {
            WireError::Protocol(msg) => WireError::Protocol(format!("socket {}: {msg}", spec.name)),
            other => other,
        })?;
        Ok(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::DirectoryDiscovery;
    use crate::overlay::OverlayEvent;
    use cilantro_types::config::SocketKindSpec;
    use tokio::sync::mpsc;

    type OverlayEvents = mpsc::UnboundedReceiver<OverlayEvent>;

    fn manager() -> (SocketManager, OverlayEvents) {
        let (discovery, rx) = DirectoryDiscovery::new();
        (SocketManager::new(Arc::new(discovery), "127.0.0.1"), rx)
    }

    #[test]
    fn test_wire_identity_prefers_verifying_key() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, _events) = manager();
        assert_eq!(manager.wire_identity("blocks"), "blocks");

        let keys = manager
            .init_security(NodeKeys::generate(), dir.path(), false)
            .unwrap();
        assert_eq!(manager.wire_identity("blocks"), keys.verifying_key_hex());
        assert!(manager.auth_store().is_some());
    }

    #[tokio::test]
    async fn test_open_rejects_unknown_protocol() {
        let spec = SocketSpec {
            name: "bad".into(),
            protocol: "udp".into(),
            port: 9000,
            ip: "127.0.0.1".into(),
            ..SocketSpec::default()
        };
        let (manager, _events) = manager();
        assert!(matches!(manager.open(&spec), Err(WireError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_open_secure_bind_needs_identity() {
        let spec = SocketSpec {
            name: "secure".into(),
            kind: SocketKindSpec::Router,
            mode: SocketMode::Bind,
            port: 9000,
            ip: "127.0.0.1".into(),
            secure: true,
            ..SocketSpec::default()
        };
        let (manager, _events) = manager();
        assert!(matches!(
            manager.open(&spec),
            Err(WireError::SecurityConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_open_connect_by_vk_defers() {
        let spec = SocketSpec {
            name: "sub".into(),
            mode: SocketMode::Connect,
            port: 9000,
            vk: "ab".repeat(32),
            ..SocketSpec::default()
        };
        let (manager, mut events) = manager();
        let socket = manager.open(&spec).unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            OverlayEvent::NotFound { .. }
        ));
        assert_eq!(socket.pending_lookup_count(), 1);
        assert_eq!(manager.overlay().pending_count(), 1);
    }
}
