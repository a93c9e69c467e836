//! Command implementations by domain.

pub mod auth;
pub mod keys;
pub mod node;
pub mod send;

/// Print an error and exit with status 1.
pub(crate) fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {msg}");
    std::process::exit(1);
}

/// A multi-threaded runtime for commands that drive sockets.
pub(crate) fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap_or_else(|e| fail(format!("Failed to start runtime: {e}")))
}
