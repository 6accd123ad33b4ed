//! Bridge between an embedded trading host and remote command clients.
//!
//! The host runs many algorithm instances, each identified by an integer handle, and
//! calls into this crate synchronously once per tick. Remote clients reach those
//! instances through per-profile servers. This crate wires the two together:
//!
//! - `registry`: the `Registry`: lazily starts one `Server` per connection profile,
//!   maps handles to sessions, and tears everything down when a server stops.
//! - `session`: per-handle state: latest quote and the single-slot command mailbox.
//! - `server`: lifecycle (`Created -> Started -> Stopped`) and the stop notification.
//! - `transport`: the seam to the remote side, plus an in-process implementation.
//!
//! Host-side flow:
//!
//! ```no_run
//! use std::sync::Arc;
//! use mt_common::{ConnectionProfile, MemoryProfileStore, Response};
//! use mt_service::{CommandSink, Registry, transport::LoopbackHub};
//!
//! fn main() -> mt_common::Result<()> {
//!     let store = MemoryProfileStore::new(vec![ConnectionProfile::new("profileA", 8222)])?;
//!     let registry = Registry::new(store, LoopbackHub::new())?;
//!
//!     let sink: Arc<dyn CommandSink> = Arc::new(|_handle: i32| {});
//!     registry.attach(1, "profileA", "EURUSD", 1.1, 1.2, sink)?;
//!     registry.publish_quote(1, "EURUSD", 1.1001, 1.2001)?;
//!     if registry.poll_command_type(1) != mt_common::NO_COMMAND {
//!         let _first = registry.fetch_command_param(1, 0);
//!         registry.post_response(1, Response::new("ok"))?;
//!     }
//!     registry.detach(1);
//!     Ok(())
//! }
//! ```
#![warn(missing_docs)]
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use registry::Registry;
pub use server::{Server, ServerState, StopEvent};
pub use session::{CommandSink, Session, SessionInfo};
pub use transport::{Transport, TransportContext, TransportFactory};
