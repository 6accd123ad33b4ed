//! Named connection profiles and the stores that resolve them.
//!
//! A `ConnectionProfile` names one endpoint a server listens on. The registry never looks
//! inside it beyond the name; host, port, and heartbeat settings are read by transports.
//! Profiles are resolved through the `ProfileStore` trait so that the registry does not
//! care whether they come from memory or a JSON file on disk.
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::result::Result;

/// Configuration of one named endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Unique profile name, the key servers are registered under.
    pub name: String,
    /// Host the transport binds to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port the transport binds to.
    pub port: u16,
    /// Milliseconds without a ping after which a remote client is dropped.
    #[serde(default)]
    pub heartbeat_timeout_ms: Option<u64>,
}

fn default_host() -> String {
    String::from("localhost")
}

impl ConnectionProfile {
    /// Creates a profile bound to `localhost` without heartbeat supervision.
    pub fn new(name: &str, port: u16) -> Self {
        ConnectionProfile {
            name: String::from(name),
            host: default_host(),
            port,
            heartbeat_timeout_ms: None,
        }
    }

    /// Builder-style setter for the heartbeat timeout.
    pub fn with_heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.heartbeat_timeout_ms = Some(ms);
        self
    }

    /// `host:port` form of the endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration collaborator consulted by the registry.
pub trait ProfileStore: Send + Sync {
    /// Looks up a profile by name. `Ok(None)` means "not found".
    fn load_profile(&self, name: &str) -> Result<Option<ConnectionProfile>>;
}

/// Immutable in-memory profile table.
#[derive(Debug, Default, Clone)]
pub struct MemoryProfileStore {
    profiles: HashMap<String, ConnectionProfile>,
}

impl MemoryProfileStore {
    /// Builds a store from a list of profiles, rejecting empty or duplicate names.
    pub fn new(profiles: Vec<ConnectionProfile>) -> Result<Self> {
        let mut table = HashMap::with_capacity(profiles.len());
        for profile in profiles {
            if profile.name.is_empty() {
                return Err(BridgeError::InvalidProfile(String::from(
                    "profile name is empty",
                )));
            }
            if table.contains_key(&profile.name) {
                return Err(BridgeError::InvalidProfile(format!(
                    "duplicate profile '{}'",
                    profile.name
                )));
            }
            table.insert(profile.name.clone(), profile);
        }
        Ok(Self { profiles: table })
    }

    /// Number of known profiles.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Returns `true` if the store holds no profiles.
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Names of all known profiles, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ProfileStore for MemoryProfileStore {
    fn load_profile(&self, name: &str) -> Result<Option<ConnectionProfile>> {
        Ok(self.profiles.get(name).cloned())
    }
}

/// Profile store backed by a JSON array of profiles.
///
/// The file is read once; later edits require building a new store.
#[derive(Debug, Clone)]
pub struct JsonProfileStore {
    inner: MemoryProfileStore,
}

impl JsonProfileStore {
    /// Reads profiles from a JSON file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading connection profiles from {}", path.display());
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Reads profiles from any reader producing a JSON array.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let profiles: Vec<ConnectionProfile> = serde_json::from_reader(reader)?;
        let inner = MemoryProfileStore::new(profiles)?;
        debug!("Loaded {} connection profile(s)", inner.len());
        Ok(Self { inner })
    }

    /// Names of all loaded profiles, sorted.
    pub fn names(&self) -> Vec<String> {
        self.inner.names()
    }
}

impl ProfileStore for JsonProfileStore {
    fn load_profile(&self, name: &str) -> Result<Option<ConnectionProfile>> {
        self.inner.load_profile(name)
    }
}
