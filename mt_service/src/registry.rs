//! Process-wide directory of servers and sessions.
//!
//! The `Registry` is built once at startup and shared by reference with every thread
//! that talks to the host API. It keeps two maps, each behind its own lock:
//!
//! - profile name -> `Server`. The lock is held across "look up, else load profile,
//!   create and start", so concurrent attaches for one profile start exactly one server.
//! - handle -> `Session`. The lock is held only to insert, fetch, or remove an entry.
//!   Quote and mailbox access happen on the fetched session without it.
//!
//! Servers report their terminal transition on a channel drained by a dedicated
//! reaper thread. The reaper unregisters the server (if it is still the one registered
//! under its name) and detaches every session it owned.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, info, warn};
use mt_common::{BridgeError, NO_COMMAND, ProfileStore, Quote, Response, Result};
use serde_json::Value;

use crate::server::{Server, StopEvent};
use crate::session::{CommandSink, Session, SessionInfo};
use crate::transport::TransportFactory;

/// How many times `attach` retries when the server it picked stops underneath it.
const MAX_ATTACH_ATTEMPTS: usize = 3;

/// Outcome of registering a fresh session with a server.
#[derive(Debug, PartialEq, Eq)]
enum Placement {
    Attached,
    /// The server stopped underneath; attach again on a fresh one.
    Retry,
}

struct RegistryInner {
    profiles: Box<dyn ProfileStore>,
    transports: Box<dyn TransportFactory>,
    servers: Mutex<HashMap<String, Arc<Server>>>,
    sessions: RwLock<HashMap<i32, Arc<Session>>>,
    stop_tx: Sender<StopEvent>,
    next_server_id: AtomicU64,
}

impl RegistryInner {
    fn lookup(&self, handle: i32) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
    }

    fn server(&self, profile: &str) -> Option<Arc<Server>> {
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(profile)
            .cloned()
    }

    /// Returns the live server for `name`, creating and starting one if needed.
    fn ensure_server(&self, name: &str) -> Result<Arc<Server>> {
        let mut servers = self.servers.lock()?;

        if let Some(server) = servers.get(name) {
            if !server.is_stopped() {
                return Ok(Arc::clone(server));
            }
            debug!("Server '{}' is stopped, replacing it", name);
            servers.remove(name);
        }

        let profile = self.profiles.load_profile(name)?.ok_or_else(|| {
            BridgeError::InvalidProfile(format!("Connection profile '{}' is not found", name))
        })?;
        if profile.name != name {
            return Err(BridgeError::InvalidProfile(format!(
                "Connection profile '{}' resolved to '{}'",
                name, profile.name
            )));
        }

        let id = self.next_server_id.fetch_add(1, Ordering::SeqCst) + 1;
        let transport = self.transports.create(&profile)?;
        let server = Arc::new(Server::new(id, profile, transport, self.stop_tx.clone()));
        server.start()?;

        servers.insert(String::from(name), Arc::clone(&server));
        Ok(server)
    }

    /// Removes `handle` from the handle map only if it still maps to `session`.
    fn forget(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let same = sessions
            .get(&session.handle())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if same {
            sessions.remove(&session.handle());
        }
        same
    }

    /// Registers `session` with `server`, then publishes it in the handle map.
    fn place(&self, server: &Server, session: &Arc<Session>) -> Result<Placement> {
        match server.add_session(Arc::clone(session)) {
            Ok(()) => self.publish(session),
            Err(BridgeError::ServerStopped(_)) => Ok(Placement::Retry),
            Err(e) => Err(e),
        }
    }

    /// Inserts `session` into the handle map, detaching whatever was there before.
    fn publish(&self, session: &Arc<Session>) -> Result<Placement> {
        let handle = session.handle();
        let previous = self.sessions.write()?.insert(handle, Arc::clone(session));
        if let Some(previous) = previous {
            warn!(
                "Handle {} attached again without detach; replacing session on '{}'",
                handle,
                previous.profile()
            );
            self.finalize(&previous);
        }

        // The stop sweep may have closed the session between registration and insert.
        if session.is_closed() {
            self.forget(session);
            return Ok(Placement::Retry);
        }
        Ok(Placement::Attached)
    }

    /// Closes a session that already left the handle map and unregisters it from its server.
    fn finalize(&self, session: &Arc<Session>) {
        session.close();
        if let Some(server) = self.server(session.profile()) {
            server.remove_session(session);
        }
    }

    fn on_server_stopped(&self, event: StopEvent) {
        let removed = {
            let mut servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
            let same = servers
                .get(&event.profile)
                .is_some_and(|current| current.id() == event.server_id);
            if same {
                servers.remove(&event.profile)
            } else {
                None
            }
        };

        let sessions = event.core.drain_sessions();
        for session in &sessions {
            session.close();
            self.forget(session);
        }
        info!(
            "Server '{}' (#{}) unregistered, {} session(s) detached",
            event.profile,
            event.server_id,
            sessions.len()
        );

        if let Some(server) = removed {
            server.stop();
        }
    }
}

fn run_reaper(registry: Weak<RegistryInner>, stop_rx: Receiver<StopEvent>) {
    // Events keep their server alive, and servers hold senders, so keep draining
    // after the registry is gone until every sender has been dropped.
    while let Ok(event) = stop_rx.recv() {
        match registry.upgrade() {
            Some(inner) => inner.on_server_stopped(event),
            None => debug!("Registry gone, dropping stop event for '{}'", event.profile),
        }
    }
    debug!("Registry reaper exiting");
}

/// Directory of servers (by profile name) and sessions (by handle).
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Builds a registry resolving profiles through `profiles` and building server
    /// transports with `transports`, and starts its reaper thread.
    pub fn new<P, T>(profiles: P, transports: T) -> Result<Self>
    where
        P: ProfileStore + 'static,
        T: TransportFactory + 'static,
    {
        let (stop_tx, stop_rx) = unbounded::<StopEvent>();
        let inner = Arc::new(RegistryInner {
            profiles: Box::new(profiles),
            transports: Box::new(transports),
            servers: Mutex::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            stop_tx,
            next_server_id: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name(String::from("registry-reaper"))
            .spawn(move || run_reaper(weak, stop_rx))?;

        Ok(Self { inner })
    }

    /// Attaches an algorithm instance.
    ///
    /// Starts a server for `profile_name` if none is live, then registers a new session
    /// for `handle` under it. A session already attached under `handle` is detached
    /// first.
    pub fn attach(
        &self,
        handle: i32,
        profile_name: &str,
        symbol: &str,
        bid: f64,
        ask: f64,
        sink: Arc<dyn CommandSink>,
    ) -> Result<()> {
        debug!(
            "attach: handle = {}, profile = {}, symbol = {}",
            handle, profile_name, symbol
        );
        if profile_name.trim().is_empty() {
            return Err(BridgeError::InvalidProfile(String::from(
                "Connection profile is null or empty",
            )));
        }

        for attempt in 1..=MAX_ATTACH_ATTEMPTS {
            let server = self.inner.ensure_server(profile_name)?;
            let session = Arc::new(Session::new(
                handle,
                profile_name,
                Quote::new(symbol, bid, ask),
                Arc::clone(&sink),
            ));

            if self.inner.place(&server, &session)? == Placement::Retry {
                debug!(
                    "attach: server '{}' #{} stopped under handle {} (attempt {})",
                    profile_name,
                    server.id(),
                    handle,
                    attempt
                );
                continue;
            }

            info!(
                "Session {} attached to '{}' (server #{})",
                handle,
                profile_name,
                server.id()
            );
            return Ok(());
        }

        error!(
            "attach: giving up on handle {} after {} attempts",
            handle, MAX_ATTACH_ATTEMPTS
        );
        Err(BridgeError::ServerStopped(String::from(profile_name)))
    }

    /// Detaches `handle`. Unknown handles are ignored.
    pub fn detach(&self, handle: i32) {
        debug!("detach: handle = {}", handle);
        let session = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);

        match session {
            Some(session) => {
                self.inner.finalize(&session);
                info!("Session {} detached from '{}'", handle, session.profile());
            }
            None => debug!("detach: no session for handle {}", handle),
        }
    }

    /// Overwrites the quote of `handle`.
    pub fn publish_quote(&self, handle: i32, symbol: &str, bid: f64, ask: f64) -> Result<()> {
        debug!(
            "publish_quote: handle = {}, symbol = {}, bid = {}, ask = {}",
            handle, symbol, bid, ask
        );
        let session = self.session_or_unknown(handle)?;
        session.set_quote(Quote::new(symbol, bid, ask));
        Ok(())
    }

    /// Answers the command pending on `handle` and wakes the remote waiter.
    pub fn post_response(&self, handle: i32, response: Response) -> Result<()> {
        debug!("post_response: handle = {}, response = {:?}", handle, response);
        self.session_or_unknown(handle)?.post_response(response)
    }

    /// Type of the command pending on `handle`; `NO_COMMAND` if none or no session.
    pub fn poll_command_type(&self, handle: i32) -> i32 {
        self.inner
            .lookup(handle)
            .map_or(NO_COMMAND, |session| session.command_type())
    }

    /// Parameter `index` of the command pending on `handle`.
    pub fn fetch_command_param(&self, handle: i32, index: i32) -> Option<Value> {
        self.inner
            .lookup(handle)
            .and_then(|session| session.command_parameter(index))
    }

    fn session_or_unknown(&self, handle: i32) -> Result<Arc<Session>> {
        self.inner.lookup(handle).ok_or_else(|| {
            debug!("No session for handle {}", handle);
            BridgeError::UnknownHandle(handle)
        })
    }

    /// Session attached under `handle`.
    pub fn session(&self, handle: i32) -> Option<Arc<Session>> {
        self.inner.lookup(handle)
    }

    /// Returns `true` if `handle` is attached.
    pub fn is_attached(&self, handle: i32) -> bool {
        self.inner.lookup(handle).is_some()
    }

    /// Snapshot of the session attached under `handle`.
    pub fn session_info(&self, handle: i32) -> Option<SessionInfo> {
        self.inner.lookup(handle).map(|session| session.info())
    }

    /// Snapshots of all attached sessions, ordered by handle.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.handle);
        infos
    }

    /// Attached handles, sorted.
    pub fn handles(&self) -> Vec<i32> {
        let mut handles: Vec<i32> = self
            .inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        handles.sort_unstable();
        handles
    }

    /// Server registered for `profile`.
    pub fn server(&self, profile: &str) -> Option<Arc<Server>> {
        self.inner.server(profile)
    }

    /// Profile names with a registered server, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Stops every registered server. Their sessions are detached by the reaper.
    pub fn shutdown(&self) {
        let servers: Vec<Arc<Server>> = self
            .inner
            .servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        if !servers.is_empty() {
            info!("Shutting down {} server(s)", servers.len());
        }
        for server in servers {
            server.stop();
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackHub;
    use mt_common::{ConnectionProfile, MemoryProfileStore};
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn registry() -> Registry {
        let store = MemoryProfileStore::new(vec![ConnectionProfile::new("profileA", 8222)]).unwrap();
        Registry::new(store, LoopbackHub::new()).unwrap()
    }

    fn sink() -> Arc<dyn CommandSink> {
        Arc::new(|_: i32| {})
    }

    #[test]
    fn empty_profile_is_rejected() {
        let registry = registry();
        let err = registry.attach(1, "", "EURUSD", 1.1, 1.2, sink()).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidProfile(_)));
        assert!(registry.server_names().is_empty());
        assert!(!registry.is_attached(1));
    }

    #[test]
    fn unknown_profile_is_rejected() {
        let registry = registry();
        let err = registry.attach(1, "missing", "EURUSD", 1.1, 1.2, sink()).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidProfile(_)));
        assert!(registry.server_names().is_empty());
    }

    #[test]
    fn attach_reuses_one_server_per_profile() {
        let registry = registry();
        registry.attach(1, "profileA", "EURUSD", 1.1, 1.2, sink()).unwrap();
        registry.attach(2, "profileA", "GBPUSD", 1.3, 1.4, sink()).unwrap();

        assert_eq!(registry.server_names(), vec!["profileA".to_string()]);
        let server = registry.server("profileA").unwrap();
        assert_eq!(server.session_handles(), vec![1, 2]);
        assert_eq!(registry.handles(), vec![1, 2]);
    }

    #[test]
    fn missing_handle_yields_sentinels() {
        let registry = registry();
        assert_eq!(registry.poll_command_type(42), NO_COMMAND);
        assert_eq!(registry.fetch_command_param(42, 0), None);
        assert!(matches!(
            registry.publish_quote(42, "EURUSD", 1.0, 1.1),
            Err(BridgeError::UnknownHandle(42))
        ));
        assert!(matches!(
            registry.post_response(42, Response::new("ok")),
            Err(BridgeError::UnknownHandle(42))
        ));
    }

    #[test]
    fn reattach_replaces_previous_session() {
        let registry = registry();
        registry.attach(5, "profileA", "EURUSD", 1.1, 1.2, sink()).unwrap();
        let first = registry.session(5).unwrap();

        registry.attach(5, "profileA", "USDJPY", 150.0, 150.1, sink()).unwrap();
        let second = registry.session(5).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(second.quote().symbol, "USDJPY");
        assert_eq!(registry.server("profileA").unwrap().session_handles(), vec![5]);
    }

    #[test]
    fn detach_unregisters_from_server() {
        let registry = registry();
        registry.attach(3, "profileA", "EURUSD", 1.1, 1.2, sink()).unwrap();
        let session = registry.session(3).unwrap();

        registry.detach(3);
        assert!(!registry.is_attached(3));
        assert!(session.is_closed());
        assert!(registry.server("profileA").unwrap().session_handles().is_empty());
    }

    #[test]
    fn session_info_reflects_mailbox() {
        let registry = registry();
        registry.attach(8, "profileA", "EURUSD", 1.1, 1.2, sink()).unwrap();
        registry
            .session(8)
            .unwrap()
            .deliver_command(mt_common::Command::new(2, vec![json!("x")]))
            .unwrap();

        let info = registry.session_info(8).unwrap();
        assert_eq!(info.profile, "profileA");
        assert_eq!(info.pending_command_type, 2);
        assert_eq!(info.quote, Quote::new("EURUSD", 1.1, 1.2));
        assert_eq!(registry.sessions(), vec![info]);
    }

    fn new_session(handle: i32) -> Arc<Session> {
        Arc::new(Session::new(handle, "profileA", Quote::new("EURUSD", 1.1, 1.2), sink()))
    }

    fn assert_on_fresh_server(registry: &Registry, handle: i32, stopped: &Server) {
        let server = registry.server("profileA").unwrap();
        assert_ne!(server.id(), stopped.id());
        assert!(!server.is_stopped());
        assert_eq!(server.session_handles(), vec![handle]);
        assert!(registry.is_attached(handle));
        assert!(!registry.session(handle).unwrap().is_closed());
    }

    #[test]
    fn server_stopped_before_registration_is_retried() {
        let registry = registry();
        let server = registry.inner.ensure_server("profileA").unwrap();
        server.stop();

        let session = new_session(1);
        assert_eq!(registry.inner.place(&server, &session).unwrap(), Placement::Retry);
        assert!(!registry.is_attached(1));

        registry.attach(1, "profileA", "EURUSD", 1.1, 1.2, sink()).unwrap();
        assert_on_fresh_server(&registry, 1, &server);
    }

    #[test]
    fn session_swept_before_publication_is_retried() {
        let registry = registry();
        let server = registry.inner.ensure_server("profileA").unwrap();
        let session = new_session(2);
        server.add_session(Arc::clone(&session)).unwrap();

        // Let the stop sweep close the session before it reaches the handle map.
        server.stop();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !session.is_closed() {
            assert!(Instant::now() < deadline, "stop sweep never ran");
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(registry.inner.publish(&session).unwrap(), Placement::Retry);
        assert!(!registry.is_attached(2));

        registry.attach(2, "profileA", "EURUSD", 1.1, 1.2, sink()).unwrap();
        assert_on_fresh_server(&registry, 2, &server);
    }
}
