//! Admission filters: per-socket-kind hooks run on every received message
//! before it reaches the handler. A filter may strip or inspect framing and
//! consume control messages by returning `false`.

use crate::message::{Multipart, CONTROL_HEARTBEAT, CONTROL_READY};
use crate::socket::TransportSocket;
use bytes::Bytes;
use tracing::{debug, warn};

pub trait AdmissionFilter: Send {
    /// Return `true` to forward `frames` to the handler.
    fn admit(&mut self, socket: &TransportSocket, frames: &mut Multipart) -> bool;
}

/// Forwards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmitAll;

impl AdmissionFilter for AdmitAll {
    fn admit(&mut self, _socket: &TransportSocket, _frames: &mut Multipart) -> bool {
        true
    }
}

/// Subscriber-side filter for broadcast sockets: forwards messages whose
/// first frame starts with a subscribed topic. The empty topic matches
/// everything; no topics match nothing.
#[derive(Debug, Clone, Default)]
pub struct TopicFilter {
    topics: Vec<Bytes>,
}

impl TopicFilter {
    pub fn new<I, T>(topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    pub fn subscribe(&mut self, topic: impl Into<Bytes>) {
        self.topics.push(topic.into());
    }

    pub fn matches(&self, frames: &[Bytes]) -> bool {
        frames
            .first()
            .is_some_and(|head| self.topics.iter().any(|t| head.starts_with(t)))
    }
}

impl AdmissionFilter for TopicFilter {
    fn admit(&mut self, _socket: &TransportSocket, frames: &mut Multipart) -> bool {
        self.matches(frames)
    }
}

/// Filter for router sockets, whose messages arrive as
/// `[sender identity][header][message type][payload]`.
///
/// A `READY` control message marks the socket ready (flushing queued sends);
/// heartbeats are dropped. Messages without a sender identity are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterFilter;

impl AdmissionFilter for RouterFilter {
    fn admit(&mut self, socket: &TransportSocket, frames: &mut Multipart) -> bool {
        if frames.len() < 2 {
            warn!(socket = %socket.name(), frames = frames.len(), "Router message without identity frame");
            return false;
        }
        let sender = String::from_utf8_lossy(&frames[0]);
        match frames.get(2).map(|t| t.as_ref()) {
            Some(CONTROL_READY) => {
                debug!(socket = %socket.name(), peer = %sender, "Peer ready");
                socket.set_ready(true);
                false
            }
            Some(CONTROL_HEARTBEAT) => {
                debug!(socket = %socket.name(), peer = %sender, "Heartbeat");
                false
            }
            _ => true,
        }
    }
}
