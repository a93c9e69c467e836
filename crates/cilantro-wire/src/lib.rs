//! Cilantro Wire: identity-addressed messaging sockets.
//!
//! Sockets are addressed either by an explicit address or by a peer's
//! verifying key. Key-addressed commands are deferred until the overlay
//! resolves the key, replayed when the answer arrives, and re-issued when
//! the peer later reappears at a new address.
//!
//! ## Architecture
//!
//! - **TransportSocket**: wraps a [`RawSocket`] with deferred connect/bind,
//!   reconnect tracking and a readiness-gated send queue
//! - **OverlayClient**: correlates discovery replies with waiting sockets
//! - **ReceiveLoop**: drives a socket's inbound stream into a handler
//! - **FrameSocket**: the tokio TCP/IPC implementation of [`RawSocket`]
//! - **SecureChannel**: authenticated key exchange and record sealing

pub mod auth;
pub mod backoff;
pub mod command;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod frame_socket;
pub mod identity;
pub mod listener;
pub mod manager;
pub mod message;
pub mod overlay;
pub mod raw;
pub mod secure;
pub mod socket;

pub use auth::{AuthStore, Authorizer};
pub use backoff::Backoff;
pub use command::{CommandQueue, ConnectArgs, DeferredCommand};
pub use endpoint::{Endpoint, Protocol};
pub use error::{WireError, WireResult};
pub use filter::{AdmissionFilter, AdmitAll, RouterFilter, TopicFilter};
pub use frame_socket::{FrameSocket, SocketKind};
pub use identity::{IdentityProvider, KeyRing, NodeKeys};
pub use listener::{FaultPolicy, FrameHandler, ListenState, ReceiveLoop};
pub use manager::SocketManager;
pub use message::Multipart;
pub use overlay::{DirectoryDiscovery, Discovery, OverlayClient, OverlayEvent, ResolutionId};
pub use raw::{FrameSource, RawSocket};
pub use secure::{ClientSecurity, SecureChannel, ServerSecurity};
pub use socket::{SocketContext, SocketIdentity, TransportSocket};
