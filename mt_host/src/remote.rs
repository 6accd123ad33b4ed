//! Remote side of the simulation.
//!
//! Connects to the loopback endpoint of a profile, keeps the connection alive with
//! periodic pings from a background thread, and cycles through the host commands
//! against every attached handle.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use mt_common::{BridgeError, Command, Result};
use mt_service::transport::{LoopbackHub, RemoteClient};
use serde_json::json;

use crate::model::host_command::HostCommand;

/// PING interval in milliseconds used by the background thread.
const PING_INTERVAL_MS: u64 = 500;
/// How long a command may wait for the host's response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for the server to come up before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Drives commands against one profile.
pub struct RemoteDriver {
    client: Arc<RemoteClient>,
    profile: String,
}

impl RemoteDriver {
    /// Waits for `profile` to start listening on `hub`, then connects.
    pub fn connect(hub: &LoopbackHub, profile: &str, shutdown: &AtomicBool) -> Result<Self> {
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            match hub.connect(profile) {
                Ok(client) => {
                    info!(
                        "Remote client #{} connected to '{}' (server #{})",
                        client.id(),
                        profile,
                        client.server_id()
                    );
                    return Ok(Self {
                        client: Arc::new(client),
                        profile: String::from(profile),
                    });
                }
                Err(e) if Instant::now() >= deadline || shutdown.load(Ordering::Relaxed) => {
                    return Err(e);
                }
                Err(_) => thread::sleep(Duration::from_millis(50)),
            }
        }
    }

    /// Spawns the keep-alive thread. It exits on shutdown or once the server is gone.
    pub fn start_ping_thread(&self, shutdown: Arc<AtomicBool>) {
        let client = Arc::clone(&self.client);
        let profile = self.profile.clone();
        info!("Ping thread started. Target: {}", profile);
        thread::spawn(move || {
            let interval = Duration::from_millis(PING_INTERVAL_MS);
            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(interval);
                match client.ping() {
                    Ok(()) => debug!("PING sent to {}", profile),
                    Err(e) => {
                        error!("PING THREAD ERROR: {}", e);
                        break;
                    }
                }
            }
            info!("Ping thread stopping...");
        });
    }

    /// Issues `count` commands (0 = until shutdown), spaced by `pause`.
    pub fn run(&self, count: u32, pause: Duration, shutdown: &AtomicBool) -> Result<()> {
        let mut sent: u32 = 0;
        while !shutdown.load(Ordering::Relaxed) && (count == 0 || sent < count) {
            thread::sleep(pause);

            let handles = self.client.handles()?;
            if handles.is_empty() {
                debug!("No handles attached to '{}' yet", self.profile);
                continue;
            }
            let handle = handles[sent as usize % handles.len()];
            let command = Self::command_for(sent);
            let code = command.command_type;

            match self.client.execute(handle, command, RESPONSE_TIMEOUT) {
                Ok(response) => info!(
                    "RESPONSE: handle={} command={} payload={}",
                    handle, code, response.payload
                ),
                Err(BridgeError::UnknownHandle(_)) | Err(BridgeError::Disconnected(_)) => {
                    warn!("Handle {} went away during command {}", handle, code);
                }
                Err(e) => return Err(e),
            }
            sent += 1;
        }
        info!("Remote driver done after {} command(s)", sent);
        Ok(())
    }

    fn command_for(seq: u32) -> Command {
        let kind = HostCommand::ALL[seq as usize % HostCommand::ALL.len()];
        let parameters = match kind {
            HostCommand::GetQuote => Vec::new(),
            HostCommand::Echo => vec![json!(seq), json!("hello")],
            HostCommand::SetSpread => vec![json!(0.0001 * f64::from(seq % 5 + 1))],
        };
        Command::new(kind.code(), parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_cycle_through_every_kind() {
        let codes: Vec<i32> = (0..6).map(|i| RemoteDriver::command_for(i).command_type).collect();
        assert_eq!(codes, vec![1, 2, 3, 1, 2, 3]);
        assert_eq!(RemoteDriver::command_for(1).parameters.len(), 2);
    }

    #[test]
    fn connect_reaches_the_profile_server() {
        use mt_common::{ConnectionProfile, MemoryProfileStore};
        use mt_service::{CommandSink, Registry};

        let store = MemoryProfileStore::new(vec![ConnectionProfile::new("sim", 1)]).unwrap();
        let hub = LoopbackHub::new();
        let registry = Registry::new(store, hub.clone()).unwrap();
        let sink: Arc<dyn CommandSink> = Arc::new(|_: i32| {});
        registry.attach(1, "sim", "EURUSD", 1.1, 1.2, sink).unwrap();

        let shutdown = AtomicBool::new(false);
        let first = RemoteDriver::connect(&hub, "sim", &shutdown).unwrap();
        let second = RemoteDriver::connect(&hub, "sim", &shutdown).unwrap();
        assert_eq!(first.client.server_id(), registry.server("sim").unwrap().id());
        assert_eq!(first.client.server_id(), second.client.server_id());
        assert_ne!(first.client.id(), second.client.id());
    }

    #[test]
    fn connect_gives_up_on_shutdown() {
        let hub = LoopbackHub::new();
        let shutdown = AtomicBool::new(true);
        assert!(RemoteDriver::connect(&hub, "nobody", &shutdown).is_err());
    }
}
