//! Node configuration types.
//!
//! Deserialized from `~/.cilantro/config.toml`. Every field has a default so a
//! partial (or missing) file still yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Role a node plays in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Accepts transactions from clients and batches them.
    #[default]
    Masternode,
    /// Relays transaction batches to delegates.
    Witness,
    /// Builds and agrees on sub-blocks.
    Delegate,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Masternode => write!(f, "masternode"),
            Self::Witness => write!(f, "witness"),
            Self::Delegate => write!(f, "delegate"),
        }
    }
}

/// Messaging pattern of a configured socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKindSpec {
    /// Every send fans out to all connected peers.
    #[default]
    Broadcast,
    /// Sends are addressed to a peer identity carried in the first frame.
    Router,
}

/// Whether a configured socket binds or connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketMode {
    #[default]
    Bind,
    Connect,
}

/// A socket the node opens at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketSpec {
    /// Socket name, used in logs.
    pub name: String,
    pub kind: SocketKindSpec,
    pub mode: SocketMode,
    pub port: u16,
    /// `tcp` or `ipc`.
    pub protocol: String,
    /// Explicit address. Empty means "resolve `vk` through discovery".
    pub ip: String,
    /// Verifying key (hex) of the peer to reach.
    pub vk: String,
    /// Security domain for authorization.
    pub domain: String,
    /// Upgrade the channel to authenticated encryption.
    pub secure: bool,
    /// Topic prefixes to admit (broadcast sockets only). Empty admits all.
    pub topics: Vec<String>,
}

impl Default for SocketSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: SocketKindSpec::default(),
            mode: SocketMode::default(),
            port: 0,
            protocol: "tcp".to_string(),
            ip: String::new(),
            vk: String::new(),
            domain: "*".to_string(),
            secure: false,
            topics: Vec::new(),
        }
    }
}

/// Static directory entry used to seed peer discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSeed {
    /// Verifying key (hex).
    pub vk: String,
    /// Address the peer is reachable at.
    pub ip: String,
}

/// Receive loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// Yield before the first receive so handlers can finish registering.
    pub startup_delay_ms: u64,
    /// Consecutive receive faults tolerated before the loop gives up.
    /// Zero means never give up.
    pub max_consecutive_faults: u32,
    pub fault_backoff_min_ms: u64,
    pub fault_backoff_max_ms: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            startup_delay_ms: 1000,
            max_consecutive_faults: 10,
            fault_backoff_min_ms: 50,
            fault_backoff_max_ms: 5000,
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human-readable node name.
    pub name: String,
    pub role: NodeRole,
    /// Address this node advertises to the network.
    pub host_ip: String,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Hex-encoded 32-byte Ed25519 seed.
    pub signing_key: Option<String>,
    /// Root of the per-node authorized-keys directories.
    pub certs_dir: PathBuf,
    /// Wipe the node's authorized keys on startup.
    pub reset_auth: bool,
    pub listener: ListenerSettings,
    pub peers: Vec<PeerSeed>,
    pub sockets: Vec<SocketSpec>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "cilantro-node".to_string(),
            role: NodeRole::default(),
            host_ip: "127.0.0.1".to_string(),
            log_level: "info".to_string(),
            signing_key: None,
            certs_dir: default_home_dir().join("certs"),
            reset_auth: false,
            listener: ListenerSettings::default(),
            peers: Vec::new(),
            sockets: Vec::new(),
        }
    }
}

/// `~/.cilantro`, or `./.cilantro` when no home directory is known.
pub fn default_home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cilantro")
}
