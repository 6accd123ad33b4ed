//! In-process transport.
//!
//! `LoopbackHub` is the `TransportFactory`: every server it builds a transport for
//! registers its endpoint with the hub under the profile name, and remote clients in the
//! same process reach it through `LoopbackHub::connect`. A `RemoteClient` can read a
//! session's quote and run a command round trip against its mailbox.
//!
//! When the profile sets `heartbeat_timeout_ms`, a watchdog thread drops clients that
//! stop pinging. Once the last client has timed out the listener is considered dead and
//! the server is told it stopped.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use log::{debug, info, warn};
use mt_common::{BridgeError, Command, ConnectionProfile, Quote, Response, Result};

use crate::transport::heartbeat::HeartbeatMonitor;
use crate::transport::{Transport, TransportContext, TransportFactory};

/// Upper bound on how often the watchdog scans for silent clients.
const MAX_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Lower bound, so tiny timeouts do not spin.
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(5);

struct Endpoint {
    ctx: TransportContext,
    heartbeat: Option<Mutex<HeartbeatMonitor>>,
    running: AtomicBool,
}

impl Endpoint {
    fn heartbeat(&self) -> Option<MutexGuard<'_, HeartbeatMonitor>> {
        self.heartbeat
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.ctx.is_stopped()
    }
}

/// Registry of running loopback endpoints, keyed by profile name.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    endpoints: Arc<Mutex<HashMap<String, Arc<Endpoint>>>>,
    next_client_id: Arc<AtomicU64>,
}

impl LoopbackHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoints(&self) -> MutexGuard<'_, HashMap<String, Arc<Endpoint>>> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if a started server is listening for `profile`.
    pub fn is_listening(&self, profile: &str) -> bool {
        self.endpoints()
            .get(profile)
            .is_some_and(|endpoint| endpoint.is_open())
    }

    /// Connects a remote client to the server listening for `profile`.
    pub fn connect(&self, profile: &str) -> Result<RemoteClient> {
        let endpoint = self
            .endpoints()
            .get(profile)
            .filter(|endpoint| endpoint.is_open())
            .cloned()
            .ok_or_else(|| {
                BridgeError::Disconnected(format!("nothing is listening for '{}'", profile))
            })?;

        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(mut monitor) = endpoint.heartbeat() {
            monitor.register(id);
        }
        info!("Remote client #{} connected to '{}'", id, profile);
        Ok(RemoteClient { id, endpoint })
    }

    fn register(&self, profile: &str, endpoint: Arc<Endpoint>) {
        self.endpoints().insert(String::from(profile), endpoint);
    }

    fn unregister(&self, profile: &str, endpoint: &Arc<Endpoint>) {
        let mut endpoints = self.endpoints();
        if endpoints
            .get(profile)
            .is_some_and(|current| Arc::ptr_eq(current, endpoint))
        {
            endpoints.remove(profile);
        }
    }
}

impl TransportFactory for LoopbackHub {
    fn create(&self, profile: &ConnectionProfile) -> Result<Box<dyn Transport>> {
        Ok(Box::new(LoopbackTransport::new(profile.clone(), self.clone())))
    }
}

/// Transport whose remote clients live in the same process.
pub struct LoopbackTransport {
    profile: ConnectionProfile,
    hub: LoopbackHub,
    endpoint: Option<Arc<Endpoint>>,
    shutdown_tx: Option<Sender<()>>,
}

impl LoopbackTransport {
    /// Creates an unstarted transport that will register with `hub`.
    pub fn new(profile: ConnectionProfile, hub: LoopbackHub) -> Self {
        Self {
            profile,
            hub,
            endpoint: None,
            shutdown_tx: None,
        }
    }
}

impl Transport for LoopbackTransport {
    fn start(&mut self, ctx: TransportContext) -> Result<()> {
        if self.endpoint.is_some() {
            return Err(BridgeError::ServerStart {
                profile: self.profile.name.clone(),
                reason: String::from("transport already started"),
            });
        }

        let timeout = self.profile.heartbeat_timeout_ms.map(Duration::from_millis);
        let endpoint = Arc::new(Endpoint {
            ctx,
            heartbeat: timeout.map(|t| Mutex::new(HeartbeatMonitor::new(t))),
            running: AtomicBool::new(true),
        });
        if let Some(timeout) = timeout {
            let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
            let watched = Arc::clone(&endpoint);
            thread::Builder::new()
                .name(format!("heartbeat-{}", self.profile.name))
                .spawn(move || run_watchdog(watched, timeout, shutdown_rx))?;
            self.shutdown_tx = Some(shutdown_tx);
        }
        self.hub.register(&self.profile.name, Arc::clone(&endpoint));

        debug!("Loopback transport for '{}' listening", self.profile.name);
        self.endpoint = Some(endpoint);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shutdown_tx.take();
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.running.store(false, Ordering::SeqCst);
            self.hub.unregister(&self.profile.name, &endpoint);
            debug!("Loopback transport for '{}' shut down", self.profile.name);
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_interval(timeout: Duration) -> Duration {
    (timeout / 4).clamp(MIN_CHECK_INTERVAL, MAX_CHECK_INTERVAL)
}

/// Scans for silent clients until the transport shuts down or the last client is lost.
fn run_watchdog(endpoint: Arc<Endpoint>, timeout: Duration, shutdown_rx: Receiver<()>) {
    let ticker = tick(check_interval(timeout));
    let profile = endpoint.ctx.profile().name.clone();

    loop {
        select! {
            recv(shutdown_rx) -> _ => break,
            recv(ticker) -> _ => {
                let (timed_out, active) = match endpoint.heartbeat() {
                    Some(mut monitor) => (monitor.check_timeouts(), monitor.active_count()),
                    None => break,
                };
                for id in &timed_out {
                    warn!("'{}': remote client #{} missed its heartbeat", profile, id);
                }
                if !timed_out.is_empty() && active == 0 {
                    warn!("'{}': no live remote clients left, stopping listener", profile);
                    endpoint.running.store(false, Ordering::SeqCst);
                    endpoint.ctx.signal_stopped();
                    break;
                }
            }
        }
    }
    debug!("Heartbeat watchdog for '{}' exiting", profile);
}

/// Remote-side handle onto one loopback endpoint.
pub struct RemoteClient {
    id: u64,
    endpoint: Arc<Endpoint>,
}

impl RemoteClient {
    /// Hub-assigned client id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identity of the server this client is connected to.
    pub fn server_id(&self) -> u64 {
        self.endpoint.ctx.server_id()
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.endpoint.is_open() {
            return Err(BridgeError::ServerStopped(
                self.endpoint.ctx.profile().name.clone(),
            ));
        }
        if let Some(mut monitor) = self.endpoint.heartbeat() {
            if !monitor.update_ping(self.id) {
                return Err(BridgeError::Disconnected(format!(
                    "client #{} timed out",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Keep-alive. Any other successful call counts as one too.
    pub fn ping(&self) -> Result<()> {
        self.ensure_connected()
    }

    /// Handles attached to the server, sorted.
    pub fn handles(&self) -> Result<Vec<i32>> {
        self.ensure_connected()?;
        Ok(self.endpoint.ctx.handles())
    }

    /// Latest quote published for `handle`.
    pub fn quote(&self, handle: i32) -> Result<Quote> {
        self.ensure_connected()?;
        self.endpoint
            .ctx
            .session(handle)
            .map(|session| session.quote())
            .ok_or(BridgeError::UnknownHandle(handle))
    }

    /// Sends `command` to `handle` and waits up to `timeout` for the host's response.
    pub fn execute(&self, handle: i32, command: Command, timeout: Duration) -> Result<Response> {
        self.ensure_connected()?;
        let session = self
            .endpoint
            .ctx
            .session(handle)
            .ok_or(BridgeError::UnknownHandle(handle))?;
        debug!(
            "Remote client #{}: command {} -> handle {}",
            self.id, command.command_type, handle
        );
        session.exchange(command, timeout)
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        if let Some(mut monitor) = self.endpoint.heartbeat() {
            monitor.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_interval_is_clamped() {
        assert_eq!(check_interval(Duration::from_millis(1)), MIN_CHECK_INTERVAL);
        assert_eq!(check_interval(Duration::from_millis(200)), Duration::from_millis(50));
        assert_eq!(check_interval(Duration::from_secs(60)), MAX_CHECK_INTERVAL);
    }

    #[test]
    fn connect_without_listener_fails() {
        let hub = LoopbackHub::new();
        assert!(!hub.is_listening("nobody"));
        assert!(matches!(hub.connect("nobody"), Err(BridgeError::Disconnected(_))));
    }
}
