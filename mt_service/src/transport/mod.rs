//! Transport seam between a server and the remote side.
//!
//! The registry never talks to the network itself. Each server owns one `Transport`,
//! built by a `TransportFactory` from the server's profile. On start the transport
//! receives a `TransportContext`: its view of the server's sessions and the one way it
//! can report that the listener is gone.
//!
//! - `heartbeat`: keep-alive bookkeeping for remote clients.
//! - `loopback`: in-process transport; remote clients live in the same process.
use std::sync::Arc;

use mt_common::{ConnectionProfile, Result};

use crate::server::{ServerCore, ServerState};
use crate::session::Session;

pub mod heartbeat;
pub mod loopback;

pub use loopback::{LoopbackHub, LoopbackTransport, RemoteClient};

/// Listener behind one server.
pub trait Transport: Send {
    /// Starts accepting remote clients. An error aborts the attach that created the server.
    fn start(&mut self, ctx: TransportContext) -> Result<()>;

    /// Stops accepting remote clients and releases resources. Must be idempotent.
    fn shutdown(&mut self);
}

/// Builds a transport for a profile.
pub trait TransportFactory: Send + Sync {
    /// Creates an unstarted transport for `profile`.
    fn create(&self, profile: &ConnectionProfile) -> Result<Box<dyn Transport>>;
}

impl<F> TransportFactory for F
where
    F: Fn(&ConnectionProfile) -> Result<Box<dyn Transport>> + Send + Sync,
{
    fn create(&self, profile: &ConnectionProfile) -> Result<Box<dyn Transport>> {
        self(profile)
    }
}

/// What a transport may see and do on its server.
#[derive(Clone)]
pub struct TransportContext {
    core: Arc<ServerCore>,
}

impl TransportContext {
    pub(crate) fn new(core: Arc<ServerCore>) -> Self {
        Self { core }
    }

    /// Profile of the owning server.
    pub fn profile(&self) -> &ConnectionProfile {
        self.core.profile()
    }

    /// Identity of the owning server.
    pub fn server_id(&self) -> u64 {
        self.core.id()
    }

    /// Session registered under `handle`.
    pub fn session(&self, handle: i32) -> Option<Arc<Session>> {
        self.core.session(handle)
    }

    /// Handles of all registered sessions, sorted.
    pub fn handles(&self) -> Vec<i32> {
        self.core.handles()
    }

    /// Returns `true` once the owning server is stopped.
    pub fn is_stopped(&self) -> bool {
        self.core.state() == ServerState::Stopped
    }

    /// Reports that the listener is gone. Only the first call has an effect.
    pub fn signal_stopped(&self) -> bool {
        self.core.stop()
    }
}
