//! The transport socket.
//!
//! A [`TransportSocket`] wraps one [`RawSocket`] and adds what the raw socket
//! cannot do on its own:
//!
//! - peers can be addressed by verifying key; the address is looked up
//!   through the [`OverlayClient`] and the call is replayed once it resolves
//! - every peer reached by key is tracked, so when the overlay reports the
//!   peer back online (possibly at a new address) the connection is torn
//!   down and re-established
//! - sends issued while the socket is not ready are parked and flushed in
//!   order once it becomes ready
//! - sockets marked secure upgrade every connect and bind to an
//!   authenticated, encrypted channel
//!
//! The lookup, tracker and active-connection tables are private to the
//! socket and only change through the methods below.

use crate::auth::Authorizer;
use crate::command::{CommandQueue, ConnectArgs, DeferredCommand};
use crate::endpoint::Endpoint;
use crate::error::{WireError, WireResult};
use crate::filter::AdmissionFilter;
use crate::identity::IdentityProvider;
use crate::listener::{FrameHandler, ReceiveLoop};
use crate::message::{three_frame, Multipart};
use crate::overlay::{OverlayClient, ResolutionId};
use crate::raw::RawSocket;
use crate::secure::{ClientSecurity, SecureChannel, ServerSecurity};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};

/// Name, security domain and security flag of a socket. Fixed at
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketIdentity {
    pub name: String,
    pub domain: String,
    pub secure: bool,
}

impl SocketIdentity {
    /// A plain-text socket in the default domain.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: crate::auth::DEFAULT_DOMAIN.to_string(),
            secure: false,
        }
    }

    /// Mark the socket secure under `domain`.
    pub fn secure(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self.secure = true;
        self
    }
}

/// Node-wide collaborators every socket references.
#[derive(Clone)]
pub struct SocketContext {
    pub overlay: Arc<OverlayClient>,
    pub keys: Arc<dyn IdentityProvider>,
    /// Required by secure binds.
    pub authorizer: Option<Arc<dyn Authorizer>>,
    /// This node's advertised address.
    pub host_ip: String,
}

struct TrackedPeer {
    command: DeferredCommand,
    /// Where the command last resolved to.
    endpoint: Option<Endpoint>,
}

struct SocketState {
    raw: Box<dyn RawSocket>,
    pending_lookups: HashMap<ResolutionId, DeferredCommand>,
    conn_tracker: HashMap<String, TrackedPeer>,
    active_conns: HashSet<Endpoint>,
    pending_sends: CommandQueue,
    ready: bool,
    handler_added: bool,
}

/// Identity-addressed, self-healing socket.
pub struct TransportSocket {
    identity: SocketIdentity,
    ctx: SocketContext,
    this: Weak<TransportSocket>,
    state: Mutex<SocketState>,
}

impl TransportSocket {
    /// Wrap `raw`. The socket starts ready.
    pub fn new(identity: SocketIdentity, raw: Box<dyn RawSocket>, ctx: SocketContext) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            identity,
            ctx,
            this: this.clone(),
            state: Mutex::new(SocketState {
                raw,
                pending_lookups: HashMap::new(),
                conn_tracker: HashMap::new(),
                active_conns: HashSet::new(),
                pending_sends: CommandQueue::new(),
                ready: true,
                handler_added: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn identity(&self) -> &SocketIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Connect to a peer given by `args.ip`, or by `args.vk` once the overlay
    /// resolves it.
    pub fn connect(&self, args: ConnectArgs) -> WireResult<()> {
        self.execute(DeferredCommand::Connect(args))
    }

    /// Bind an address given by `args.ip`, or by `args.vk` once the overlay
    /// resolves it.
    pub fn bind(&self, args: ConnectArgs) -> WireResult<()> {
        self.execute(DeferredCommand::Bind(args))
    }

    fn execute(&self, command: DeferredCommand) -> WireResult<()> {
        let mut state = self.lock();
        let args = command.args();
        if !args.ip.is_empty() {
            let endpoint = command.endpoint(&self.ctx.host_ip)?;
            return self.apply(&mut state, &command, endpoint);
        }
        if args.vk.is_empty() {
            return Err(WireError::Protocol(format!(
                "{} on port {} needs an ip or a verifying key",
                command.name(),
                args.port
            )));
        }
        if args.port == 0 {
            return Err(WireError::Protocol(format!(
                "{} to verifying key {} needs a port",
                command.name(),
                args.vk
            )));
        }

        self.check_security(&command)?;

        let vk = args.vk.clone();
        let id = self.ctx.overlay.resolve(&vk, self.this.clone())?;
        if state.pending_lookups.contains_key(&id) {
            return Err(WireError::Configuration(format!(
                "socket {} already awaits resolution {id}",
                self.identity.name
            )));
        }
        state.pending_lookups.insert(id.clone(), command.clone());
        state
            .conn_tracker
            .entry(vk.clone())
            .and_modify(|tracked| tracked.command = command.clone())
            .or_insert(TrackedPeer {
                command: command.clone(),
                endpoint: None,
            });
        debug!(
            socket = %self.identity.name,
            vk = %vk,
            id = %id,
            op = command.name(),
            "Deferred until the verifying key resolves"
        );
        Ok(())
    }

    fn client_security(&self, args: &ConnectArgs) -> WireResult<Option<ClientSecurity>> {
        if !self.identity.secure {
            return Ok(None);
        }
        SecureChannel::for_connect(self.ctx.keys.as_ref(), &args.vk, &self.identity.domain)
            .map(Some)
    }

    fn server_security(&self) -> WireResult<Option<ServerSecurity>> {
        if !self.identity.secure {
            return Ok(None);
        }
        SecureChannel::for_bind(
            self.ctx.keys.as_ref(),
            self.ctx.authorizer.clone(),
            &self.identity.domain,
        )
        .map(Some)
    }

    /// Fail now if `command` could not be upgraded once it resolves.
    fn check_security(&self, command: &DeferredCommand) -> WireResult<()> {
        match command {
            DeferredCommand::Connect(args) => self.client_security(args).map(drop),
            DeferredCommand::Bind(_) => self.server_security().map(drop),
        }
    }

    /// Issue the raw connect or bind for a resolved command.
    fn apply(
        &self,
        state: &mut SocketState,
        command: &DeferredCommand,
        endpoint: Endpoint,
    ) -> WireResult<()> {
        // Security is configured before touching the active set.
        match command {
            DeferredCommand::Connect(args) => {
                let security = self.client_security(args)?;
                state.active_conns.insert(endpoint.clone());
                state.raw.connect(&endpoint, security)?;
            }
            DeferredCommand::Bind(_) => {
                let security = self.server_security()?;
                state.active_conns.insert(endpoint.clone());
                state.raw.bind(&endpoint, security)?;
            }
        }
        info!(
            socket = %self.identity.name,
            endpoint = %endpoint,
            op = command.name(),
            secure = self.identity.secure,
            "Socket operation issued"
        );
        Ok(())
    }

    /// Complete a pending lookup: replay the peer's latest intent with `ip`.
    ///
    /// An id this socket is not waiting for is a
    /// [`WireError::Configuration`] error.
    pub fn on_resolved(&self, id: &ResolutionId, ip: &str) -> WireResult<()> {
        let mut state = self.lock();
        let command = state.pending_lookups.remove(id).ok_or_else(|| {
            WireError::Configuration(format!(
                "socket {} has no pending lookup {id}",
                self.identity.name
            ))
        })?;
        let vk = command.args().vk.clone();
        let command = match state.conn_tracker.get(&vk) {
            Some(tracked) => tracked.command.with_ip(ip),
            None => command.with_ip(ip),
        };
        let endpoint = command.endpoint(&self.ctx.host_ip)?;
        if let Some(tracked) = state.conn_tracker.get_mut(&vk) {
            tracked.endpoint = Some(endpoint.clone());
        }
        debug!(socket = %self.identity.name, vk = %vk, ip, id = %id, "Verifying key resolved");
        self.apply(&mut state, &command, endpoint)
    }

    /// Drop a pending lookup the overlay could not answer. Not retried.
    pub fn on_unresolvable(&self, id: &ResolutionId, vk: &str) -> WireResult<()> {
        let mut state = self.lock();
        state.pending_lookups.remove(id).ok_or_else(|| {
            WireError::Configuration(format!(
                "socket {} has no pending lookup {id}",
                self.identity.name
            ))
        })?;
        warn!(
            socket = %self.identity.name,
            vk,
            id = %id,
            "Could not resolve verifying key; lookup dropped"
        );
        Ok(())
    }

    /// Re-establish the connection to a tracked peer that came back online.
    ///
    /// Untracked peers are ignored. Address-in-use failures are expected
    /// when re-binding and are ignored; other failures are logged.
    pub fn on_peer_online(&self, vk: &str, ip: &str) {
        let mut state = self.lock();
        let Some(tracked) = state.conn_tracker.get(vk) else {
            debug!(socket = %self.identity.name, vk, "Online peer is not tracked");
            return;
        };
        let command = tracked.command.with_ip(ip);
        let previous = tracked.endpoint.clone();
        let endpoint = match command.endpoint(&self.ctx.host_ip) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(socket = %self.identity.name, vk, ip, error = %e, "Cannot reconnect peer");
                return;
            }
        };

        // Old descriptor first, then the new one if it is still up.
        let stale = previous
            .into_iter()
            .filter(|old| *old != endpoint)
            .chain(std::iter::once(endpoint.clone()));
        for old in stale {
            if state.active_conns.remove(&old) {
                if let Err(e) = state.raw.disconnect(&old) {
                    warn!(socket = %self.identity.name, endpoint = %old, error = %e, "Disconnect failed");
                }
            }
        }
        if let Some(tracked) = state.conn_tracker.get_mut(vk) {
            tracked.endpoint = Some(endpoint.clone());
        }

        match self.apply(&mut state, &command, endpoint) {
            Ok(()) => info!(socket = %self.identity.name, vk, ip, "Peer reconnected"),
            Err(e) if e.is_addr_in_use() => {
                debug!(socket = %self.identity.name, vk, ip, "Address already bound")
            }
            Err(e) => warn!(
                socket = %self.identity.name,
                vk,
                ip,
                error = %e,
                "Failed to reconnect peer"
            ),
        }
    }

    /// Send a three-frame message, or park it while the socket is not ready.
    pub fn send(
        &self,
        header: impl Into<Bytes>,
        msg_type: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> WireResult<()> {
        self.send_multipart(three_frame(header, msg_type, payload))
    }

    /// Send a three-frame message to one peer of a router socket.
    pub fn send_to(
        &self,
        peer: impl Into<Bytes>,
        header: impl Into<Bytes>,
        msg_type: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> WireResult<()> {
        let mut frames = three_frame(header, msg_type, payload);
        frames.insert(0, peer.into());
        self.send_multipart(frames)
    }

    pub fn send_multipart(&self, frames: Multipart) -> WireResult<()> {
        let mut state = self.lock();
        if !state.ready {
            state.pending_sends.push(frames);
            debug!(
                socket = %self.identity.name,
                queued = state.pending_sends.len(),
                "Socket not ready, send queued"
            );
            return Ok(());
        }
        state.raw.send_multipart(frames)
    }

    /// Change readiness. Becoming ready flushes queued sends in order.
    pub fn set_ready(&self, ready: bool) {
        let mut state = self.lock();
        state.ready = ready;
        if !ready {
            return;
        }
        let queued = state.pending_sends.drain();
        if !queued.is_empty() {
            debug!(socket = %self.identity.name, count = queued.len(), "Flushing queued sends");
        }
        for frames in queued {
            if let Err(e) = state.raw.send_multipart(frames) {
                warn!(socket = %self.identity.name, error = %e, "Queued send failed");
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Register the socket's single receive handler and return the loop that
    /// feeds it. The caller decides when to run the loop.
    pub fn add_handler<H>(
        self: &Arc<Self>,
        handler: H,
        handler_key: Option<String>,
    ) -> WireResult<ReceiveLoop>
    where
        H: FrameHandler + 'static,
    {
        let mut state = self.lock();
        if state.handler_added {
            return Err(WireError::Configuration(format!(
                "socket {} already has a handler",
                self.identity.name
            )));
        }
        let source = state.raw.take_source().ok_or_else(|| {
            WireError::Configuration(format!(
                "receive side of socket {} is not available",
                self.identity.name
            ))
        })?;
        state.handler_added = true;
        debug!(socket = %self.identity.name, key = ?handler_key, "Handler registered");
        Ok(ReceiveLoop::new(
            Arc::clone(self),
            source,
            Box::new(handler),
            handler_key,
        ))
    }

    /// [`Self::add_handler`] with an admission filter.
    pub fn add_filtered_handler<H, F>(
        self: &Arc<Self>,
        handler: H,
        handler_key: Option<String>,
        filter: F,
    ) -> WireResult<ReceiveLoop>
    where
        H: FrameHandler + 'static,
        F: AdmissionFilter + 'static,
    {
        Ok(self.add_handler(handler, handler_key)?.with_filter(filter))
    }

    /// Release the underlying socket.
    pub fn close(&self) {
        self.lock().raw.close();
        debug!(socket = %self.identity.name, "Socket released");
    }

    pub fn peer_count(&self) -> usize {
        self.lock().raw.peer_count()
    }

    pub fn active_connections(&self) -> HashSet<Endpoint> {
        self.lock().active_conns.clone()
    }

    pub fn is_active(&self, endpoint: &Endpoint) -> bool {
        self.lock().active_conns.contains(endpoint)
    }

    pub fn pending_lookup_count(&self) -> usize {
        self.lock().pending_lookups.len()
    }

    pub fn tracked_peer_count(&self) -> usize {
        self.lock().conn_tracker.len()
    }

    /// The latest connect/bind issued for `vk`, if the peer is tracked.
    pub fn tracked_command(&self, vk: &str) -> Option<DeferredCommand> {
        self.lock()
            .conn_tracker
            .get(vk)
            .map(|tracked| tracked.command.clone())
    }

    pub fn queued_sends(&self) -> usize {
        self.lock().pending_sends.len()
    }
}

impl fmt::Debug for TransportSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSocket")
            .field("identity", &self.identity)
            .field("host_ip", &self.ctx.host_ip)
            .finish_non_exhaustive()
    }
}
