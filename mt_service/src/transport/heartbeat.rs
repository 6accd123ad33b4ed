//! Keep-alive tracker for remote clients.
//!
//! The monitor records when each client (identified by the id its transport assigned)
//! was last heard from. It exposes three core operations:
//!
//! - `HeartbeatMonitor::update_ping(id)`: record a fresh ping for an active client.
//! - `HeartbeatMonitor::check_timeouts()`: mark clients that exceeded the timeout as
//!   inactive and return their ids.
//! - `HeartbeatMonitor::is_client_active(id)`: read-only activity check.
//!
//! Time is measured with `std::time::Instant`, which is monotonic. The monitor is not
//! synchronized; transports wrap it in a `Mutex`. A client that timed out stays
//! inactive: its pings are ignored and `check_timeouts` does not report it twice.
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct ClientConnection {
    last_ping: Instant,
    is_active: bool,
}

/// Tracks client keep-alive pings and determines inactivity based on a timeout.
pub struct HeartbeatMonitor {
    clients: HashMap<u64, ClientConnection>,
    timeout: Duration,
}

impl HeartbeatMonitor {
    /// Creates a monitor dropping clients silent for longer than `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            timeout,
        }
    }

    /// Starts tracking a client as if it had just pinged.
    pub fn register(&mut self, id: u64) {
        self.clients.insert(
            id,
            ClientConnection {
                last_ping: Instant::now(),
                is_active: true,
            },
        );
    }

    /// Stops tracking a client.
    pub fn remove(&mut self, id: u64) {
        self.clients.remove(&id);
    }

    /// Records a ping. Returns `false` for unknown or timed out clients.
    pub fn update_ping(&mut self, id: u64) -> bool {
        match self.clients.get_mut(&id) {
            Some(conn) if conn.is_active => {
                conn.last_ping = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Marks clients silent for longer than the timeout as inactive and returns them.
    pub fn check_timeouts(&mut self) -> Vec<u64> {
        self.check_timeouts_at(Instant::now())
    }

    fn check_timeouts_at(&mut self, now: Instant) -> Vec<u64> {
        let timeout = self.timeout;
        let mut timed_out = Vec::new();
        for (id, conn) in self.clients.iter_mut() {
            if conn.is_active && now.duration_since(conn.last_ping) > timeout {
                conn.is_active = false;
                timed_out.push(*id);
            }
        }
        timed_out.sort_unstable();
        timed_out
    }

    /// Returns `true` while the client is tracked and has not timed out.
    pub fn is_client_active(&self, id: u64) -> bool {
        self.clients.get(&id).is_some_and(|conn| conn.is_active)
    }

    /// Number of clients still considered alive.
    pub fn active_count(&self) -> usize {
        self.clients.values().filter(|conn| conn.is_active).count()
    }
}
