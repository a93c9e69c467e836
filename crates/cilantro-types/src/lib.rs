//! Shared types for the Cilantro node.
//!
//! This crate holds the configuration model consumed by the wire layer and
//! the `cilantro` binary. It contains no business logic.

pub mod config;

pub use config::{
    ListenerSettings, NodeConfig, NodeRole, PeerSeed, SocketKindSpec, SocketMode, SocketSpec,
};
