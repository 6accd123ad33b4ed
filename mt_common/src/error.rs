//! Error types shared by the bridge crates.
//!
//! The `BridgeError` enum unifies the failure cases of profile resolution, session
//! addressing, server lifecycle, and the I/O and channel plumbing underneath, allowing
//! every crate in the workspace to propagate a single error type.
use std::io;
use std::sync::PoisonError;

use thiserror::Error;

/// Unified error type shared by the registry, transports, and host.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Profile name is empty or the configuration store has no such profile.
    #[error("Invalid connection profile: {0}")]
    InvalidProfile(String),

    /// No session is attached for the addressed handle.
    #[error("Unknown handle: {0}")]
    UnknownHandle(i32),

    /// The transport of a freshly created server refused to start.
    #[error("Server for profile '{profile}' failed to start: {reason}")]
    ServerStart {
        /// Profile the server was created for.
        profile: String,
        /// Human-readable failure reported by the transport.
        reason: String,
    },

    /// The addressed server has already reached its terminal state.
    #[error("Server for profile '{0}' is stopped")]
    ServerStopped(String),

    /// A command was rejected before it reached a mailbox.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// A remote waiter gave up before a response was posted.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The session or remote client went away while a call was in flight.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// I/O error originating from the standard library (profile files, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failure while encoding/decoding JSON via serde_json.
    #[error("JSON serialization/deserialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Crossbeam/channel send failed (e.g., receiver dropped); contains a short context string.
    #[error("Channel send failed: {0}")]
    ChannelSend(String),

    /// Crossbeam/channel receive failed (e.g., sender closed); contains a short context string.
    #[error("Channel receive failed: {0}")]
    ChannelRecv(String),

    /// Error indicating a poisoned mutex/lock was encountered.
    #[error("Mutex Lock Poisoned: {0}")]
    MutexLock(String),
}

impl<T> From<PoisonError<T>> for BridgeError {
    fn from(err: PoisonError<T>) -> Self {
        BridgeError::MutexLock(err.to_string())
    }
}
