//! Deferred socket commands.
//!
//! A connect/bind that names a peer only by verifying key cannot run until the
//! discovery service answers. The call is captured as a [`DeferredCommand`] and
//! replayed with the resolved IP filled in. Sends issued while a socket is not
//! ready are parked in a [`CommandQueue`] and flushed in FIFO order.

use crate::endpoint::{Endpoint, Protocol};
use crate::error::{WireError, WireResult};
use crate::message::Multipart;
use std::collections::VecDeque;

/// Arguments of a connect or bind call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectArgs {
    pub port: u16,
    pub protocol: Protocol,
    /// Resolved address. Empty until known.
    pub ip: String,
    /// Verifying key (hex) of the peer. May be empty when `ip` is given.
    pub vk: String,
}

impl ConnectArgs {
    /// Tcp arguments with neither ip nor verifying key set.
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
            ip: String::new(),
            vk: String::new(),
        }
    }

    /// Ipc arguments; `path` plays the role of the ip.
    pub fn ipc(path: impl Into<String>, port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Ipc,
            ip: path.into(),
            vk: String::new(),
        }
    }

    /// Arguments with the protocol given by name. Unknown protocols are
    /// rejected with [`WireError::Protocol`].
    pub fn with_protocol(port: u16, protocol: &str) -> WireResult<Self> {
        Ok(Self {
            protocol: protocol.parse()?,
            ..Self::tcp(port)
        })
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    pub fn vk(mut self, vk: impl Into<String>) -> Self {
        self.vk = vk.into();
        self
    }

    /// Resolve to an endpoint. Requires `ip`.
    pub fn endpoint(&self, host_ip: &str) -> WireResult<Endpoint> {
        if self.ip.is_empty() {
            return Err(WireError::Protocol(format!(
                "no ip available for port {} (vk '{}')",
                self.port, self.vk
            )));
        }
        Endpoint::resolve(self.protocol, &self.ip, self.port, host_ip)
    }
}

/// A connect or bind call captured for later replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredCommand {
    Connect(ConnectArgs),
    Bind(ConnectArgs),
}

impl DeferredCommand {
    pub fn args(&self) -> &ConnectArgs {
        match self {
            Self::Connect(args) | Self::Bind(args) => args,
        }
    }

    /// The same command with `ip` replaced.
    pub fn with_ip(&self, ip: &str) -> Self {
        match self {
            Self::Connect(args) => Self::Connect(args.clone().ip(ip)),
            Self::Bind(args) => Self::Bind(args.clone().ip(ip)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Bind(_) => "bind",
        }
    }

    pub fn endpoint(&self, host_ip: &str) -> WireResult<Endpoint> {
        self.args().endpoint(host_ip)
    }
}

/// FIFO of sends parked while a socket is not ready.
#[derive(Debug, Default)]
pub struct CommandQueue {
    sends: VecDeque<Multipart>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frames: Multipart) {
        self.sends.push_back(frames);
    }

    /// Remove and return every parked send, oldest first.
    pub fn drain(&mut self) -> Vec<Multipart> {
        self.sends.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.sends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_with_ip_keeps_variant_and_args() {
        let cmd = DeferredCommand::Connect(ConnectArgs::tcp(9000).vk("abcd"));
        let replay = cmd.with_ip("10.0.0.2");
        match &replay {
            DeferredCommand::Connect(args) => {
                assert_eq!(args.ip, "10.0.0.2");
                assert_eq!(args.vk, "abcd");
                assert_eq!(args.port, 9000);
            }
            other => panic!("Expected Connect, got {other:?}"),
        }
        assert_eq!(
            replay.endpoint("").unwrap().to_string(),
            "tcp://10.0.0.2:9000"
        );
        assert_eq!(DeferredCommand::Bind(ConnectArgs::tcp(1)).name(), "bind");
    }

    #[test]
    fn test_endpoint_requires_ip() {
        let cmd = DeferredCommand::Bind(ConnectArgs::tcp(9000).vk("abcd"));
        assert!(matches!(cmd.endpoint(""), Err(WireError::Protocol(_))));
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        assert!(ConnectArgs::with_protocol(9000, "ipc").is_ok());
        assert!(matches!(
            ConnectArgs::with_protocol(9000, "inproc"),
            Err(WireError::Protocol(_))
        ));
    }

    #[test]
    fn test_queue_is_fifo() {
        let mut queue = CommandQueue::new();
        for i in 0..3u8 {
            queue.push(vec![Bytes::from(vec![i])]);
        }
        assert_eq!(queue.len(), 3);
        let drained = queue.drain();
        assert!(queue.is_empty());
        let order: Vec<u8> = drained.iter().map(|m| m[0][0]).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }
}
