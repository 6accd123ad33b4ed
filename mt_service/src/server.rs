//! Per-profile server: lifecycle, owned sessions, and the stop notification.
//!
//! A `Server` is created by the registry the first time a profile is attached to and
//! walks through `Created -> Started -> Stopped`. `Stopped` is terminal. Entering it
//! emits exactly one `StopEvent` on the registry's channel, whichever side triggered
//! the stop: the registry (`Server::stop`) or the transport (`TransportContext::signal_stopped`).
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::Sender;
use log::{debug, info};
use mt_common::{BridgeError, ConnectionProfile, Result};
use strum_macros::Display;

use crate::session::Session;
use crate::transport::{Transport, TransportContext};

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ServerState {
    /// Constructed, transport not started yet.
    Created,
    /// Transport running; sessions may be added.
    Started,
    /// Terminal. Sessions are being (or have been) swept by the registry.
    Stopped,
}

/// One-shot notification that a server reached `Stopped`.
pub struct StopEvent {
    /// Profile name the server was registered under.
    pub profile: String,
    /// Identity of the stopped server; later servers for the same name differ.
    pub server_id: u64,
    pub(crate) core: Arc<ServerCore>,
}

struct ServerInner {
    state: ServerState,
    sessions: HashMap<i32, Arc<Session>>,
}

/// State shared between a server and its transport threads.
pub(crate) struct ServerCore {
    id: u64,
    profile: ConnectionProfile,
    inner: Mutex<ServerInner>,
    stop_tx: Sender<StopEvent>,
    notified: AtomicBool,
}

impl ServerCore {
    fn inner(&self) -> MutexGuard<'_, ServerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub(crate) fn state(&self) -> ServerState {
        self.inner().state
    }

    pub(crate) fn session(&self, handle: i32) -> Option<Arc<Session>> {
        self.inner().sessions.get(&handle).cloned()
    }

    pub(crate) fn handles(&self) -> Vec<i32> {
        let mut handles: Vec<i32> = self.inner().sessions.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Moves to `Stopped` and emits the stop event. Returns `false` if already stopped.
    pub(crate) fn stop(self: &Arc<Self>) -> bool {
        {
            let mut inner = self.inner();
            if inner.state == ServerState::Stopped {
                return false;
            }
            inner.state = ServerState::Stopped;
        }
        info!("Server '{}' (#{}) stopped", self.profile.name, self.id);

        if !self.notified.swap(true, Ordering::SeqCst) {
            let event = StopEvent {
                profile: self.profile.name.clone(),
                server_id: self.id,
                core: Arc::clone(self),
            };
            if self.stop_tx.send(event).is_err() {
                debug!(
                    "Server '{}' (#{}): nobody is listening for the stop event",
                    self.profile.name, self.id
                );
            }
        }
        true
    }

    /// Takes every session out of a stopped server.
    pub(crate) fn drain_sessions(&self) -> Vec<Arc<Session>> {
        self.inner().sessions.drain().map(|(_, s)| s).collect()
    }
}

/// A started listener for one connection profile and the sessions registered with it.
pub struct Server {
    core: Arc<ServerCore>,
    transport: Mutex<Box<dyn Transport>>,
}

impl Server {
    pub(crate) fn new(
        id: u64,
        profile: ConnectionProfile,
        transport: Box<dyn Transport>,
        stop_tx: Sender<StopEvent>,
    ) -> Self {
        let core = ServerCore {
            id,
            profile,
            inner: Mutex::new(ServerInner {
                state: ServerState::Created,
                sessions: HashMap::new(),
            }),
            stop_tx,
            notified: AtomicBool::new(false),
        };
        Self {
            core: Arc::new(core),
            transport: Mutex::new(transport),
        }
    }

    /// Registry-assigned identity, unique for the registry's lifetime.
    pub fn id(&self) -> u64 {
        self.core.id()
    }

    /// Profile this server was started for.
    pub fn profile(&self) -> &ConnectionProfile {
        self.core.profile()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.core.state()
    }

    /// Returns `true` once the server reached its terminal state.
    pub fn is_stopped(&self) -> bool {
        self.state() == ServerState::Stopped
    }

    /// Handles of the sessions currently registered here, sorted.
    pub fn session_handles(&self) -> Vec<i32> {
        self.core.handles()
    }

    /// Session registered here under `handle`.
    pub fn session(&self, handle: i32) -> Option<Arc<Session>> {
        self.core.session(handle)
    }

    /// Starts the transport and moves to `Started`.
    ///
    /// On failure the server goes straight to `Stopped` without emitting a stop event,
    /// since it was never published.
    pub(crate) fn start(&self) -> Result<()> {
        if self.state() != ServerState::Created {
            return Err(BridgeError::ServerStart {
                profile: self.profile().name.clone(),
                reason: format!("server is {}", self.state()),
            });
        }

        let ctx = TransportContext::new(Arc::clone(&self.core));
        let started = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .start(ctx);

        let mut inner = self.core.inner();
        match started {
            // The transport may already have signalled a stop from inside `start`.
            Ok(()) if inner.state == ServerState::Stopped => {
                Err(BridgeError::ServerStopped(self.profile().name.clone()))
            }
            Ok(()) => {
                inner.state = ServerState::Started;
                info!(
                    "Server '{}' (#{}) started on {}",
                    self.profile().name,
                    self.id(),
                    self.profile().endpoint()
                );
                Ok(())
            }
            Err(e) => {
                inner.state = ServerState::Stopped;
                self.core.notified.store(true, Ordering::SeqCst);
                Err(BridgeError::ServerStart {
                    profile: self.profile().name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Registers `session`. Fails with `ServerStopped` once the server is stopped.
    pub(crate) fn add_session(&self, session: Arc<Session>) -> Result<()> {
        let mut inner = self.core.inner();
        if inner.state == ServerState::Stopped {
            return Err(BridgeError::ServerStopped(self.profile().name.clone()));
        }
        inner.sessions.insert(session.handle(), session);
        Ok(())
    }

    /// Unregisters `session` if it is still the one registered under its handle.
    pub(crate) fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut inner = self.core.inner();
        let same = inner
            .sessions
            .get(&session.handle())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if same {
            inner.sessions.remove(&session.handle());
        }
        same
    }

    /// Stops the server: moves to `Stopped`, emits the stop event if nobody did yet,
    /// and shuts the transport down. Safe to call repeatedly.
    pub fn stop(&self) {
        self.core.stop();
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id())
            .field("profile", &self.profile().name)
            .field("state", &self.state())
            .finish()
    }
}
