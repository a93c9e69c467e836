//! Capability interface over the underlying message socket.
//!
//! [`TransportSocket`](crate::socket::TransportSocket) composes over a
//! `RawSocket` and only uses the operations listed here. The receive side is
//! split off as a [`FrameSource`] so the receive loop can own it while the
//! transport socket keeps issuing connects and sends.

use crate::endpoint::Endpoint;
use crate::error::WireResult;
use crate::message::Multipart;
use crate::secure::{ClientSecurity, ServerSecurity};
use async_trait::async_trait;

/// Operations a transport socket performs on its underlying socket.
///
/// All methods are synchronous: they start the operation and return. Any
/// connection work happens in the background.
pub trait RawSocket: Send {
    /// Start connecting to `endpoint`, optionally over a secure channel.
    fn connect(&mut self, endpoint: &Endpoint, security: Option<ClientSecurity>)
        -> WireResult<()>;

    /// Bind `endpoint`. Fails with an address-in-use transport error when the
    /// address is already bound.
    fn bind(&mut self, endpoint: &Endpoint, security: Option<ServerSecurity>) -> WireResult<()>;

    /// Tear down the connection or binding for `endpoint`.
    fn disconnect(&mut self, endpoint: &Endpoint) -> WireResult<()>;

    /// Queue one multipart message for delivery.
    fn send_multipart(&mut self, frames: Multipart) -> WireResult<()>;

    /// Hand out the receive side. Returns `None` once taken.
    fn take_source(&mut self) -> Option<Box<dyn FrameSource>>;

    /// Number of established peer connections.
    fn peer_count(&self) -> usize {
        0
    }

    /// Release every connection and binding. Idempotent.
    fn close(&mut self);
}

/// Receive side of a raw socket.
#[async_trait]
pub trait FrameSource: Send {
    /// Await the next multipart message.
    ///
    /// Returns [`WireError::ConnectionClosed`](crate::error::WireError) once
    /// the socket has been closed.
    async fn recv_multipart(&mut self) -> WireResult<Multipart>;
}
