//! Framed tokio socket: the concrete [`RawSocket`].
//!
//! A `FrameSocket` can bind any number of endpoints and connect to any number
//! of others at the same time. Binds happen synchronously so address
//! conflicts are reported to the caller. Connects dial in a background task
//! that keeps redialing with exponential backoff whenever the connection
//! drops.
//!
//! Every connection starts with an optional secure handshake (see
//! [`crate::secure`]) followed by a greeting in which both sides announce
//! their identity. Afterwards each record carries one multipart message.
//!
//! Two socket kinds are supported:
//!
//! - [`SocketKind::Broadcast`]: a send goes to every connected peer.
//! - [`SocketKind::Router`]: the first frame of a send names the destination
//!   peer identity and is stripped; received messages are prefixed with the
//!   sender's identity frame.

use crate::backoff::Backoff;
use crate::endpoint::{Endpoint, Protocol};
use crate::error::{WireError, WireResult};
use crate::message::{
    decode_multipart, encode_multipart, read_record, write_record, HandshakeMessage, Multipart,
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
use crate::raw::{FrameSource, RawSocket};
use crate::secure::{
    client_handshake, server_handshake, ClientSecurity, Opener, Sealer, ServerSecurity,
};
use async_trait::async_trait;
use bytes::Bytes;
use cilantro_types::config::SocketKindSpec;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// AES-GCM tag added to every sealed record.
const SEAL_OVERHEAD: usize = 16;

/// Message pattern of a [`FrameSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Broadcast,
    Router,
}

impl From<SocketKindSpec> for SocketKind {
    fn from(spec: SocketKindSpec) -> Self {
        match spec {
            SocketKindSpec::Broadcast => Self::Broadcast,
            SocketKindSpec::Router => Self::Router,
        }
    }
}

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

type BoxStream = Box<dyn Stream>;

fn ensure_supported(endpoint: &Endpoint) -> WireResult<()> {
    if cfg!(unix) || endpoint.protocol() == Protocol::Tcp {
        Ok(())
    } else {
        Err(WireError::Protocol(format!(
            "ipc endpoints are not supported on this platform: {endpoint}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Listening and dialing
// ---------------------------------------------------------------------------

enum Listener {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: std::path::PathBuf,
    },
}

impl Listener {
    fn bind(endpoint: &Endpoint) -> WireResult<Self> {
        match endpoint.protocol() {
            Protocol::Tcp => {
                let listener = std::net::TcpListener::bind(endpoint.host_port())?;
                listener.set_nonblocking(true)?;
                Ok(Self::Tcp(tokio::net::TcpListener::from_std(listener)?))
            }
            Protocol::Ipc => bind_ipc(endpoint),
        }
    }

    async fn accept(&self) -> io::Result<(BoxStream, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let stream: BoxStream = Box::new(stream);
                Ok((stream, addr.to_string()))
            }
            #[cfg(unix)]
            Self::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                let stream: BoxStream = Box::new(stream);
                Ok((stream, path.display().to_string()))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        match self {
            Self::Tcp(_) => {}
            #[cfg(unix)]
            Self::Unix { path, .. } => {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

#[cfg(unix)]
fn bind_ipc(endpoint: &Endpoint) -> WireResult<Listener> {
    use std::os::unix::net::{UnixListener, UnixStream};

    let path = endpoint.ipc_path();
    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        // Socket file left behind by a process that is gone.
        Err(e) if e.kind() == io::ErrorKind::AddrInUse && UnixStream::connect(&path).is_err() => {
            std::fs::remove_file(&path)?;
            UnixListener::bind(&path)?
        }
        Err(e) => return Err(e.into()),
    };
    listener.set_nonblocking(true)?;
    Ok(Listener::Unix {
        listener: tokio::net::UnixListener::from_std(listener)?,
        path,
    })
}

#[cfg(not(unix))]
fn bind_ipc(endpoint: &Endpoint) -> WireResult<Listener> {
    ensure_supported(endpoint)?;
    unreachable!("ipc is rejected on non-unix platforms")
}

async fn dial(endpoint: &Endpoint) -> WireResult<BoxStream> {
    match endpoint.protocol() {
        Protocol::Tcp => {
            let stream = TcpStream::connect(endpoint.host_port()).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        Protocol::Ipc => dial_ipc(endpoint).await,
    }
}

#[cfg(unix)]
async fn dial_ipc(endpoint: &Endpoint) -> WireResult<BoxStream> {
    let stream = tokio::net::UnixStream::connect(endpoint.ipc_path()).await?;
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn dial_ipc(endpoint: &Endpoint) -> WireResult<BoxStream> {
    ensure_supported(endpoint)?;
    unreachable!("ipc is rejected on non-unix platforms")
}

// ---------------------------------------------------------------------------
// Peer bookkeeping
// ---------------------------------------------------------------------------

struct PeerLink {
    identity: Bytes,
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl PeerLink {
    /// The writer half has exited; the link is about to leave the table.
    fn dropped(&self) {
        debug!(
            peer = %String::from_utf8_lossy(&self.identity),
            "Peer is disconnecting, message dropped"
        );
    }
}

#[derive(Default)]
struct PeerTable {
    next_id: u64,
    links: HashMap<u64, PeerLink>,
}

type Peers = Arc<Mutex<PeerTable>>;

fn lock(peers: &Peers) -> MutexGuard<'_, PeerTable> {
    peers.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes a connection from the peer table when the connection ends.
struct Registration {
    peers: Peers,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&self.peers).links.remove(&self.id);
    }
}

/// State every connection task of one socket shares.
#[derive(Clone)]
struct Shared {
    kind: SocketKind,
    identity: String,
    peers: Peers,
    inbound: mpsc::UnboundedSender<WireResult<Multipart>>,
}

impl Shared {
    fn register(&self, identity: Bytes, outbound: mpsc::UnboundedSender<Bytes>) -> Registration {
        let mut table = lock(&self.peers);
        let id = table.next_id;
        table.next_id += 1;
        table.links.insert(id, PeerLink { identity, outbound });
        Registration {
            peers: Arc::clone(&self.peers),
            id,
        }
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

struct RecordWriter<W> {
    writer: W,
    sealer: Option<Sealer>,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    async fn send_body(&mut self, body: &[u8]) -> WireResult<()> {
        match self.sealer.as_mut() {
            Some(sealer) => {
                let sealed = sealer.seal(body)?;
                write_record(&mut self.writer, &sealed).await
            }
            None => write_record(&mut self.writer, body).await,
        }
    }

    async fn send_handshake(&mut self, msg: &HandshakeMessage) -> WireResult<()> {
        let body = serde_json::to_vec(msg)?;
        self.send_body(&body).await
    }
}

struct RecordReader<R> {
    reader: R,
    opener: Option<Opener>,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    async fn recv_body(&mut self) -> WireResult<Vec<u8>> {
        let body = read_record(&mut self.reader).await?;
        match self.opener.as_mut() {
            Some(opener) => opener.open(&body),
            None => Ok(body),
        }
    }

    async fn recv_handshake(&mut self) -> WireResult<HandshakeMessage> {
        let body = self.recv_body().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

enum Side {
    Client(Option<ClientSecurity>),
    Server(Option<ServerSecurity>),
}

/// Run one connection until either side hangs up.
async fn serve_connection(
    stream: BoxStream,
    side: Side,
    shared: &Shared,
    endpoint: &Endpoint,
) -> WireResult<()> {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (sealer, opener) = match side {
        Side::Client(Some(security)) => {
            let (sealer, opener) = client_handshake(&mut reader, &mut writer, &security).await?;
            (Some(sealer), Some(opener))
        }
        Side::Server(Some(security)) => {
            let (sealer, opener, _) = server_handshake(&mut reader, &mut writer, &security).await?;
            (Some(sealer), Some(opener))
        }
        Side::Client(None) | Side::Server(None) => (None, None),
    };
    let secure = sealer.is_some();
    let mut writer = RecordWriter { writer, sealer };
    let mut reader = RecordReader { reader, opener };

    writer
        .send_handshake(&HandshakeMessage::Greeting {
            identity: shared.identity.clone(),
            protocol_version: PROTOCOL_VERSION,
            secure,
        })
        .await?;
    let remote = match reader.recv_handshake().await? {
        HandshakeMessage::Greeting {
            identity,
            protocol_version,
            ..
        } if protocol_version == PROTOCOL_VERSION => identity,
        HandshakeMessage::Greeting {
            protocol_version, ..
        } => {
            return Err(WireError::Handshake(format!(
                "protocol version mismatch: local={PROTOCOL_VERSION}, remote={protocol_version}"
            )));
        }
        HandshakeMessage::Error { code, message } => {
            return Err(WireError::Handshake(format!(
                "peer rejected connection ({code}): {message}"
            )));
        }
        other => {
            return Err(WireError::Handshake(format!(
                "expected greeting, got {other:?}"
            )));
        }
    };

    let (outbound, queued) = mpsc::unbounded_channel();
    let remote_frame = Bytes::from(remote.clone());
    let _registration = shared.register(remote_frame.clone(), outbound);
    info!(endpoint = %endpoint, peer = %remote, secure, "Peer connected");

    let result = tokio::select! {
        r = pump_inbound(&mut reader, shared, remote_frame) => r,
        r = pump_outbound(&mut writer, queued) => r,
    };
    debug!(endpoint = %endpoint, peer = %remote, "Peer disconnected");
    match result {
        Err(WireError::ConnectionClosed) => Ok(()),
        other => other,
    }
}

async fn pump_inbound(
    reader: &mut RecordReader<ReadHalf<BoxStream>>,
    shared: &Shared,
    sender: Bytes,
) -> WireResult<()> {
    loop {
        let body = reader.recv_body().await?;
        let item = decode_multipart(&body).map(|mut frames| {
            if shared.kind == SocketKind::Router {
                frames.insert(0, sender.clone());
            }
            frames
        });
        if shared.inbound.send(item).is_err() {
            return Ok(());
        }
    }
}

async fn pump_outbound(
    writer: &mut RecordWriter<WriteHalf<BoxStream>>,
    mut queued: mpsc::UnboundedReceiver<Bytes>,
) -> WireResult<()> {
    while let Some(body) = queued.recv().await {
        writer.send_body(&body).await?;
    }
    Ok(())
}

async fn dial_loop(
    endpoint: Endpoint,
    security: Option<ClientSecurity>,
    shared: Shared,
    backoff: Backoff,
) {
    let mut attempt: u32 = 0;
    loop {
        match dial(&endpoint).await {
            Ok(stream) => {
                attempt = 0;
                let side = Side::Client(security.clone());
                match serve_connection(stream, side, &shared, &endpoint).await {
                    Ok(()) => debug!(endpoint = %endpoint, "Connection closed, redialing"),
                    Err(e) => warn!(endpoint = %endpoint, error = %e, "Connection failed"),
                }
            }
            Err(e) => debug!(endpoint = %endpoint, attempt, error = %e, "Dial failed"),
        }
        if shared.inbound.is_closed() {
            return;
        }
        tokio::time::sleep(backoff.delay(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

async fn accept_loop(
    listener: Arc<Listener>,
    endpoint: Endpoint,
    security: Option<ServerSecurity>,
    shared: Shared,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(endpoint = %endpoint, remote = %remote, "Accepted connection");
                    let shared = shared.clone();
                    let endpoint = endpoint.clone();
                    let side = Side::Server(security.clone());
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(stream, side, &shared, &endpoint).await {
                            warn!(endpoint = %endpoint, remote = %remote, error = %e, "Inbound connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

// ---------------------------------------------------------------------------
// FrameSocket
// ---------------------------------------------------------------------------

struct BoundListener {
    listener: Arc<Listener>,
    task: JoinHandle<()>,
}

struct InboundFrames {
    rx: mpsc::UnboundedReceiver<WireResult<Multipart>>,
}

#[async_trait]
impl FrameSource for InboundFrames {
    async fn recv_multipart(&mut self) -> WireResult<Multipart> {
        self.rx
            .recv()
            .await
            .unwrap_or(Err(WireError::ConnectionClosed))
    }
}

/// Tokio TCP / Unix-socket implementation of [`RawSocket`].
///
/// Must be used from within a Tokio runtime.
pub struct FrameSocket {
    kind: SocketKind,
    identity: String,
    peers: Peers,
    inbound: Option<mpsc::UnboundedSender<WireResult<Multipart>>>,
    source: Option<mpsc::UnboundedReceiver<WireResult<Multipart>>>,
    dialers: HashMap<Endpoint, JoinHandle<()>>,
    listeners: HashMap<Endpoint, BoundListener>,
    /// Unbound listeners whose accept task may still be winding down.
    retired: HashMap<Endpoint, Weak<Listener>>,
    backoff: Backoff,
}

impl FrameSocket {
    /// Create a socket announcing `identity` to its peers.
    pub fn new(kind: SocketKind, identity: impl Into<String>) -> Self {
        let (inbound, source) = mpsc::unbounded_channel();
        Self {
            kind,
            identity: identity.into(),
            peers: Arc::default(),
            inbound: Some(inbound),
            source: Some(source),
            dialers: HashMap::new(),
            listeners: HashMap::new(),
            retired: HashMap::new(),
            backoff: Backoff::default(),
        }
    }

    /// Override the redial backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn shared(&self) -> WireResult<Shared> {
        let inbound = self.inbound.clone().ok_or(WireError::ConnectionClosed)?;
        Ok(Shared {
            kind: self.kind,
            identity: self.identity.clone(),
            peers: Arc::clone(&self.peers),
            inbound,
        })
    }
}

fn encode_checked(frames: &[Bytes]) -> WireResult<Bytes> {
    let body = encode_multipart(frames)?;
    if body.len() + SEAL_OVERHEAD > MAX_MESSAGE_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: body.len().min(u32::MAX as usize) as u32,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(Bytes::from(body))
}

impl RawSocket for FrameSocket {
    fn connect(
        &mut self,
        endpoint: &Endpoint,
        security: Option<ClientSecurity>,
    ) -> WireResult<()> {
        ensure_supported(endpoint)?;
        if self
            .dialers
            .get(endpoint)
            .is_some_and(|task| !task.is_finished())
        {
            debug!(endpoint = %endpoint, "Already connecting");
            return Ok(());
        }
        let shared = self.shared()?;
        let task = tokio::spawn(dial_loop(endpoint.clone(), security, shared, self.backoff));
        debug!(endpoint = %endpoint, identity = %self.identity, "Connecting");
        self.dialers.insert(endpoint.clone(), task);
        Ok(())
    }

    fn bind(&mut self, endpoint: &Endpoint, security: Option<ServerSecurity>) -> WireResult<()> {
        ensure_supported(endpoint)?;
        if self.listeners.contains_key(endpoint) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{endpoint} is already bound"),
            )
            .into());
        }
        let shared = self.shared()?;
        // A listener unbound moments ago may still be open; take it over.
        let listener = match self.retired.remove(endpoint).and_then(|w| w.upgrade()) {
            Some(listener) => listener,
            None => Arc::new(Listener::bind(endpoint)?),
        };
        let task = tokio::spawn(accept_loop(
            Arc::clone(&listener),
            endpoint.clone(),
            security,
            shared,
        ));
        info!(endpoint = %endpoint, identity = %self.identity, "Bound");
        self.listeners
            .insert(endpoint.clone(), BoundListener { listener, task });
        Ok(())
    }

    fn disconnect(&mut self, endpoint: &Endpoint) -> WireResult<()> {
        self.retired.retain(|_, listener| listener.strong_count() > 0);
        if let Some(task) = self.dialers.remove(endpoint) {
            task.abort();
            debug!(endpoint = %endpoint, "Disconnected");
        } else if let Some(bound) = self.listeners.remove(endpoint) {
            bound.task.abort();
            self.retired
                .insert(endpoint.clone(), Arc::downgrade(&bound.listener));
            debug!(endpoint = %endpoint, "Unbound");
        } else {
            debug!(endpoint = %endpoint, "Disconnect of unknown endpoint ignored");
        }
        Ok(())
    }

    fn send_multipart(&mut self, mut frames: Multipart) -> WireResult<()> {
        if self.inbound.is_none() {
            return Err(WireError::ConnectionClosed);
        }
        match self.kind {
            SocketKind::Broadcast => {
                let body = encode_checked(&frames)?;
                let peers = lock(&self.peers);
                if peers.links.is_empty() {
                    debug!(identity = %self.identity, "No peers connected, message dropped");
                }
                for link in peers.links.values() {
                    if link.outbound.send(body.clone()).is_err() {
                        link.dropped();
                    }
                }
            }
            SocketKind::Router => {
                if frames.is_empty() {
                    return Err(WireError::Protocol(
                        "router send requires a destination identity frame".into(),
                    ));
                }
                let destination = frames.remove(0);
                let body = encode_checked(&frames)?;
                let peers = lock(&self.peers);
                // Newest connection wins when a peer reconnected.
                let link = peers
                    .links
                    .iter()
                    .filter(|(_, link)| link.identity == destination)
                    .max_by_key(|(id, _)| **id)
                    .map(|(_, link)| link);
                match link {
                    Some(link) => {
                        if link.outbound.send(body).is_err() {
                            link.dropped();
                        }
                    }
                    None => debug!(
                        destination = %String::from_utf8_lossy(&destination),
                        "Unroutable message dropped"
                    ),
                }
            }
        }
        Ok(())
    }

    fn take_source(&mut self) -> Option<Box<dyn FrameSource>> {
        self.source
            .take()
            .map(|rx| Box::new(InboundFrames { rx }) as Box<dyn FrameSource>)
    }

    fn peer_count(&self) -> usize {
        lock(&self.peers).links.len()
    }

    fn close(&mut self) {
        for (_, task) in self.dialers.drain() {
            task.abort();
        }
        for (_, bound) in self.listeners.drain() {
            bound.task.abort();
        }
        self.retired.clear();
        lock(&self.peers).links.clear();
        if self.inbound.take().is_some() {
            debug!(identity = %self.identity, "Socket closed");
        }
    }
}

impl Drop for FrameSocket {
    fn drop(&mut self) {
        self.close();
    }
}
